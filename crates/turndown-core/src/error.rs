//! Error types for turndown operations

use thiserror::Error;

/// Errors that can occur while scaling a cluster down or up.
#[derive(Debug, Error)]
pub enum TurndownError {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("failed to serialize object: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("compute provider error: {0}")]
    Provider(String),

    #[error("failed to drain node {node}: {reason}")]
    Drain { node: String, reason: String },

    #[error("turndown strategy error: {0}")]
    Strategy(String),

    #[error("invalid capture annotation {key}={value:?}: {reason}")]
    InvalidCapture {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("failed to locate any node pools to scale up")]
    NothingToRestore,

    #[error("node pools {0:?} are empty and their size before turndown is unknown")]
    UnknownPoolSize(Vec<String>),
}

pub type Result<T> = std::result::Result<T, TurndownError>;
