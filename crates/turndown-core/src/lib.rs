//! Reversible cluster turndown
//!
//! This crate provides the core functionality for:
//! - Flattening workloads with an annotation-based undo log
//! - Draining nodes and resizing node pools to zero
//! - Restoring the cluster to its prior configuration
//! - Health checks and observability

pub mod client;
pub mod drain;
pub mod error;
pub mod flatten;
pub mod health;
pub mod manager;
pub mod models;
pub mod observability;
pub mod patch;
pub mod provider;
pub mod settings;
pub mod strategy;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use client::{ClusterClient, KubeClusterClient};
pub use drain::{Drainer, EvictionDrainer};
pub use error::{Result, TurndownError};
pub use flatten::{FlattenReport, Flattener};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use manager::TurndownManager;
pub use models::*;
pub use observability::{TurndownLogger, TurndownMetrics};
pub use provider::{AutoscalerManagedProvider, ComputeProvider};
pub use settings::TurndownSettings;
pub use strategy::{StandardStrategy, TurndownStrategy};
