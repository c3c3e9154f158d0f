//! HTTP API for health checks, Prometheus metrics and turndown status

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};
use turndown_core::{
    health::{components, ComponentStatus, HealthRegistry},
    observability::TurndownMetrics,
    TurndownManager, TurndownRecord,
};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: TurndownMetrics,
    pub manager: Arc<Mutex<TurndownManager>>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: TurndownMetrics,
        manager: Arc<Mutex<TurndownManager>>,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            manager,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub node: String,
    pub scaled_down: bool,
    /// `None` when the host node could not be looked up
    pub on_turndown_node: Option<bool>,
    pub record: Option<TurndownRecord>,
}

/// Health check response - returns 200 if healthy, 503 if degraded/unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Current turndown state and the record scale-up would restore from
async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let manager = state.manager.lock().await;

    let on_turndown_node = match manager.is_running_on_turndown_node().await {
        Ok(on_node) => {
            state.health_registry.set_healthy(components::KUBERNETES).await;
            Some(on_node)
        }
        Err(e) => {
            warn!(error = %e, "Failed to look up turndown host node");
            state
                .health_registry
                .set_degraded(components::KUBERNETES, e.to_string())
                .await;
            None
        }
    };

    Json(StatusResponse {
        node: manager.current_node().to_string(),
        scaled_down: manager.is_scaled_down(),
        on_turndown_node,
        record: manager.record().cloned(),
    })
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/status", get(status))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;
    use turndown_core::testing::{node, pool, FakeCluster, FakeDrainer, FakeProvider};
    use turndown_core::{StandardStrategy, TurndownSettings, TURNDOWN_NODE_LABEL};

    fn test_manager(cluster: &FakeCluster) -> TurndownManager {
        let settings = TurndownSettings::default();
        let client: Arc<dyn turndown_core::ClusterClient> = Arc::new(cluster.clone());
        TurndownManager::new(
            client.clone(),
            Arc::new(FakeProvider::new(vec![pool("fixed", false, 3)])),
            Arc::new(StandardStrategy::from_settings(client, "node-a", &settings)),
            Arc::new(FakeDrainer::new()),
            "node-a",
            &settings,
        )
    }

    async fn setup_test_app(cluster: &FakeCluster) -> (Router, Arc<AppState>) {
        let health_registry = HealthRegistry::new();
        health_registry.register(components::KUBERNETES).await;
        health_registry.register(components::ENVIRONMENT).await;

        let state = Arc::new(AppState::new(
            health_registry,
            TurndownMetrics::new(),
            Arc::new(Mutex::new(test_manager(cluster))),
        ));
        (create_router(state.clone()), state)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_healthz_returns_ok_when_degraded() {
        let (app, state) = setup_test_app(&FakeCluster::new()).await;
        state
            .health_registry
            .set_degraded(components::KUBERNETES, "1 node failed to drain")
            .await;

        let (status, health) = get_json(app, "/healthz").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["status"], "degraded");
    }

    #[tokio::test]
    async fn test_healthz_returns_503_when_unhealthy() {
        let (app, state) = setup_test_app(&FakeCluster::new()).await;
        state
            .health_registry
            .set_unhealthy(components::KUBERNETES, "API server unreachable")
            .await;

        let (status, health) = get_json(app, "/healthz").await;

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(health["status"], "unhealthy");
    }

    #[tokio::test]
    async fn test_readyz_follows_environment() {
        let (app, state) = setup_test_app(&FakeCluster::new()).await;

        let (status, readiness) = get_json(app.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(readiness["ready"], false);

        state.health_registry.set_ready(true).await;
        let (status, _) = get_json(app.clone(), "/readyz").await;
        assert_eq!(status, StatusCode::OK);

        state
            .health_registry
            .set_unhealthy(components::ENVIRONMENT, "kube-dns missing")
            .await;
        let (status, readiness) = get_json(app, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(readiness["reason"], "Turndown environment not prepared");
    }

    #[tokio::test]
    async fn test_metrics_endpoint_exposes_turndown_metrics() {
        let (app, _state) = setup_test_app(&FakeCluster::new()).await;

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("turndown_scaled_down"));
    }

    #[tokio::test]
    async fn test_status_lookup_failure_degrades_kubernetes() {
        let cluster = FakeCluster::new();
        cluster.fail_node_listing();
        let (app, _state) = setup_test_app(&cluster).await;

        let (status, body) = get_json(app.clone(), "/status").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["on_turndown_node"].is_null());

        let (status, health) = get_json(app, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(health["status"], "degraded");
        assert_eq!(health["components"]["kubernetes"]["status"], "degraded");
    }

    #[tokio::test]
    async fn test_status_reports_held_record() {
        let cluster = FakeCluster::new();
        cluster.add_node(node("node-a", &[(TURNDOWN_NODE_LABEL, "true")]));
        let (app, state) = setup_test_app(&cluster).await;

        let (_, status) = get_json(app.clone(), "/status").await;
        assert_eq!(status["node"], "node-a");
        assert_eq!(status["scaled_down"], false);
        assert_eq!(status["on_turndown_node"], true);
        assert!(status["record"].is_null());

        let mut record = TurndownRecord::new(false);
        record.target_pools.push(pool("fixed", false, 3));
        state.manager.lock().await.restore_record(record);

        let (_, status) = get_json(app, "/status").await;
        assert_eq!(status["scaled_down"], true);
        assert_eq!(status["record"]["target_pools"][0]["name"], "fixed");
        assert_eq!(status["record"]["target_pools"][0]["node_count"], 3);
    }
}
