//! Cluster turndown
//!
//! Runs as a single-replica Deployment. On start it pins itself to the
//! turndown host node, then holds a [`TurndownManager`] for scale-down and
//! scale-up and serves health, metrics and status.

use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use turndown_core::{
    client::{connect, ClusterClient, KubeClusterClient},
    health::{components, HealthRegistry},
    observability::{TurndownLogger, TurndownMetrics},
    AutoscalerManagedProvider, ComputeProvider, EvictionDrainer, StandardStrategy,
    TurndownManager,
};

mod api;
mod config;

const TURNDOWN_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!("Starting cluster-turndown");

    let config = config::TurndownConfig::load()?;
    let settings = &config.settings;
    info!(node_name = %config.node_name, namespace = %settings.namespace, "Turndown configured");

    let health_registry = HealthRegistry::new();
    health_registry.register(components::KUBERNETES).await;
    health_registry.register(components::PROVIDER).await;
    health_registry.register(components::ENVIRONMENT).await;

    let metrics = TurndownMetrics::new();

    let logger = TurndownLogger::new(config.node_name.clone());
    logger.log_startup(TURNDOWN_VERSION);

    let kube_client = match connect(settings.connect_timeout(), settings.read_timeout()).await {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "Failed to build Kubernetes client");
            health_registry
                .set_unhealthy(components::KUBERNETES, e.to_string())
                .await;
            return Err(e.into());
        }
    };
    let client: Arc<dyn ClusterClient> = Arc::new(KubeClusterClient::new(kube_client));
    let provider: Arc<dyn ComputeProvider> = Arc::new(AutoscalerManagedProvider::new(
        client.clone(),
        settings.node_pool_label.clone(),
    ));

    match provider.get_node_pools().await {
        Ok(pools) => info!(pools = pools.len(), "Node pools discovered"),
        Err(e) => {
            warn!(error = %e, "Failed to enumerate node pools");
            health_registry
                .set_degraded(components::PROVIDER, e.to_string())
                .await;
        }
    }

    let manager = TurndownManager::new(
        client.clone(),
        provider,
        Arc::new(StandardStrategy::from_settings(
            client.clone(),
            config.node_name.clone(),
            settings,
        )),
        Arc::new(EvictionDrainer::from_settings(client, settings)),
        config.node_name.clone(),
        settings,
    )
    .with_health(health_registry.clone());

    // Reported to the environment health component; the API still serves
    if let Err(e) = manager.prepare_turndown_environment().await {
        warn!(error = %e, "Failed to prepare turndown environment");
    }

    let app_state = Arc::new(api::AppState::new(
        health_registry.clone(),
        metrics,
        Arc::new(Mutex::new(manager)),
    ));

    health_registry.set_ready(true).await;

    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            logger.log_shutdown("SIGINT received");
        }
        result = api_handle => {
            let reason = match result {
                Ok(Ok(())) => "API server exited".to_string(),
                Ok(Err(e)) => format!("API server failed: {}", e),
                Err(e) => format!("API server task panicked: {}", e),
            };
            logger.log_shutdown(&reason);
        }
    }

    info!("Shutting down");
    Ok(())
}
