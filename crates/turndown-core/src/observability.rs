//! Observability infrastructure for cluster turndown
//!
//! Provides:
//! - Prometheus metrics (transition latency and outcomes, workload patches, drains, resizes)
//! - Structured JSON logging with tracing

use crate::models::WorkloadKind;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    HistogramVec, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

/// Histogram buckets for scale transitions (in seconds); drains dominate
const TRANSITION_BUCKETS: &[f64] = &[1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<TurndownMetricsInner> = OnceLock::new();

struct TurndownMetricsInner {
    transition_duration_seconds: HistogramVec,
    transitions_total: IntCounterVec,
    workloads_patched: IntCounterVec,
    workload_failures: IntCounterVec,
    drain_failures: IntCounter,
    resize_failures: IntCounter,
    scaled_down: IntGauge,
    target_pools: IntGauge,
}

impl TurndownMetricsInner {
    fn new() -> Self {
        Self {
            transition_duration_seconds: register_histogram_vec!(
                "turndown_transition_duration_seconds",
                "Time spent in a scale-down, scale-up or environment preparation",
                &["transition"],
                TRANSITION_BUCKETS.to_vec()
            )
            .expect("Failed to register transition_duration_seconds"),

            transitions_total: register_int_counter_vec!(
                "turndown_transitions_total",
                "Scale transitions by outcome",
                &["transition", "result"]
            )
            .expect("Failed to register transitions_total"),

            workloads_patched: register_int_counter_vec!(
                "turndown_workloads_patched_total",
                "Workloads patched by the flattener",
                &["kind", "pass"]
            )
            .expect("Failed to register workloads_patched_total"),

            workload_failures: register_int_counter_vec!(
                "turndown_workload_failures_total",
                "Workloads the flattener failed to patch",
                &["kind", "pass"]
            )
            .expect("Failed to register workload_failures_total"),

            drain_failures: register_int_counter!(
                "turndown_drain_failures_total",
                "Nodes that could not be drained"
            )
            .expect("Failed to register drain_failures_total"),

            resize_failures: register_int_counter!(
                "turndown_resize_failures_total",
                "Failed node pool resize requests"
            )
            .expect("Failed to register resize_failures_total"),

            scaled_down: register_int_gauge!(
                "turndown_scaled_down",
                "1 while the cluster is scaled down"
            )
            .expect("Failed to register scaled_down"),

            target_pools: register_int_gauge!(
                "turndown_target_pools",
                "Node pools held at zero by the current turndown"
            )
            .expect("Failed to register target_pools"),
        }
    }
}

/// Turndown metrics for Prometheus exposition
///
/// This is a lightweight handle to the global metrics instance.
/// Multiple clones share the same underlying metrics.
#[derive(Clone)]
pub struct TurndownMetrics {
    _private: (),
}

impl Default for TurndownMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl TurndownMetrics {
    /// Create a new metrics handle (initializes global metrics if needed)
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(TurndownMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &TurndownMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    /// Record the outcome and duration of a transition
    pub fn observe_transition(&self, transition: &str, success: bool, duration_secs: f64) {
        let result = if success { "success" } else { "failure" };
        self.inner()
            .transition_duration_seconds
            .with_label_values(&[transition])
            .observe(duration_secs);
        self.inner()
            .transitions_total
            .with_label_values(&[transition, result])
            .inc();
    }

    pub fn inc_workloads_patched(&self, kind: WorkloadKind, pass: &str) {
        self.inner()
            .workloads_patched
            .with_label_values(&[kind.as_str(), pass])
            .inc();
    }

    pub fn inc_workload_failures(&self, kind: WorkloadKind, pass: &str) {
        self.inner()
            .workload_failures
            .with_label_values(&[kind.as_str(), pass])
            .inc();
    }

    pub fn inc_drain_failures(&self) {
        self.inner().drain_failures.inc();
    }

    pub fn inc_resize_failures(&self) {
        self.inner().resize_failures.inc();
    }

    /// Update the scaled-down state gauges
    pub fn set_scaled_down(&self, scaled_down: bool, target_pools: usize) {
        self.inner().scaled_down.set(i64::from(scaled_down));
        self.inner().target_pools.set(target_pools as i64);
    }
}

/// Structured logger for turndown events
///
/// Emits consistent, event-tagged records for the transitions an operator
/// cares about.
#[derive(Clone)]
pub struct TurndownLogger {
    node_name: String,
}

impl TurndownLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "turndown_started",
            node = %self.node_name,
            version = %version,
            "Cluster turndown started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "turndown_shutdown",
            node = %self.node_name,
            reason = %reason,
            "Cluster turndown shutting down"
        );
    }

    pub fn log_environment_prepared(&self, host_node: &str) {
        info!(
            event = "environment_prepared",
            node = %self.node_name,
            host_node = %host_node,
            "Turndown environment prepared"
        );
    }

    pub fn log_scale_down(&self, auto_scaling: bool, target_pools: &[&str], drained: usize) {
        info!(
            event = "cluster_scaled_down",
            node = %self.node_name,
            auto_scaling = auto_scaling,
            target_pools = ?target_pools,
            drained_nodes = drained,
            "Cluster scaled down"
        );
    }

    pub fn log_scale_up(&self, auto_scaling: bool, target_pools: &[&str]) {
        info!(
            event = "cluster_scaled_up",
            node = %self.node_name,
            auto_scaling = auto_scaling,
            target_pools = ?target_pools,
            "Cluster scaled up"
        );
    }

    pub fn log_drain_failure(&self, drained_node: &str, error: &str) {
        warn!(
            event = "node_drain_failed",
            node = %self.node_name,
            drained_node = %drained_node,
            error = %error,
            "Failed to drain node, continuing"
        );
    }

    /// Resize failures are not rolled back; nodes may already be drained
    pub fn log_resize_failure(&self, pools: &[&str], size: Option<u32>, error: &str) {
        warn!(
            event = "node_pool_resize_failed",
            node = %self.node_name,
            pools = ?pools,
            size = ?size,
            error = %error,
            "Node pool resize failed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_turndown_metrics_creation() {
        let metrics = TurndownMetrics::new();

        metrics.observe_transition("scale_down", true, 12.0);
        metrics.inc_workloads_patched(WorkloadKind::Deployment, "flatten");
        metrics.inc_workload_failures(WorkloadKind::CronJob, "expand");
        metrics.inc_drain_failures();
        metrics.inc_resize_failures();
        metrics.set_scaled_down(true, 2);
    }

    #[test]
    fn test_turndown_logger_creation() {
        let logger = TurndownLogger::new("test-node");
        assert_eq!(logger.node_name, "test-node");
    }
}
