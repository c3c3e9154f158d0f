//! Node draining through the eviction API

use crate::client::ClusterClient;
use crate::error::{Result, TurndownError};
use crate::settings::TurndownSettings;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Annotation carried by static pods mirrored from a kubelet manifest
const MIRROR_POD_ANNOTATION: &str = "kubernetes.io/config.mirror";

#[async_trait]
pub trait Drainer: Send + Sync {
    /// Cordon a node and evict the pods running on it
    async fn drain(&self, node_name: &str) -> Result<()>;
}

/// Cordons by patch and evicts pods one at a time with a fixed backoff.
///
/// DaemonSet pods and mirror pods are left in place; neither can be
/// rescheduled elsewhere. Pods that already ran to completion are skipped.
pub struct EvictionDrainer {
    client: Arc<dyn ClusterClient>,
    retries: u32,
    backoff: Duration,
}

impl EvictionDrainer {
    pub fn new(client: Arc<dyn ClusterClient>, retries: u32, backoff: Duration) -> Self {
        Self {
            client,
            retries: retries.max(1),
            backoff,
        }
    }

    pub fn from_settings(client: Arc<dyn ClusterClient>, settings: &TurndownSettings) -> Self {
        Self::new(client, settings.eviction_retries, settings.eviction_backoff())
    }

    async fn cordon(&self, node_name: &str) -> Result<()> {
        let patch = json!({ "spec": { "unschedulable": true } });
        self.client.patch_node(node_name, &patch).await
    }

    async fn evict(&self, namespace: &str, name: &str) -> Result<()> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.client.evict_pod(namespace, name).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.retries => return Err(e),
                Err(e) => {
                    debug!(
                        namespace = %namespace,
                        pod = %name,
                        attempt = attempt,
                        error = %e,
                        "Eviction refused, retrying"
                    );
                    tokio::time::sleep(self.backoff).await;
                }
            }
        }
    }
}

fn is_terminated(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded" | "Failed")
    )
}

/// Pods a drain leaves alone
fn is_pinned(pod: &Pod) -> bool {
    let daemon_set_owned = pod
        .owner_references()
        .iter()
        .any(|owner| owner.kind == "DaemonSet");
    daemon_set_owned
        || pod.annotations().contains_key(MIRROR_POD_ANNOTATION)
        || is_terminated(pod)
}

#[async_trait]
impl Drainer for EvictionDrainer {
    async fn drain(&self, node_name: &str) -> Result<()> {
        self.cordon(node_name).await?;

        let pods = self.client.list_pods_on_node(node_name).await?;
        let mut failed = Vec::new();
        let mut evicted = 0usize;

        for pod in pods.iter().filter(|p| !is_pinned(p)) {
            let namespace = pod.namespace().unwrap_or_default();
            let name = pod.name_any();
            match self.evict(&namespace, &name).await {
                Ok(()) => evicted += 1,
                Err(e) => {
                    warn!(
                        node = %node_name,
                        namespace = %namespace,
                        pod = %name,
                        error = %e,
                        "Failed to evict pod"
                    );
                    failed.push(format!("{}/{}", namespace, name));
                }
            }
        }

        if !failed.is_empty() {
            return Err(TurndownError::Drain {
                node: node_name.to_string(),
                reason: format!("could not evict {}", failed.join(", ")),
            });
        }

        info!(node = %node_name, evicted = evicted, "Node drained");
        Ok(())
    }
}
