//! Host node selection and DNS tolerations
//!
//! The turndown process has to keep running while everything else is scaled
//! away. A [`TurndownStrategy`] decides which node hosts it and makes sure
//! cluster DNS can follow it there.

use crate::client::ClusterClient;
use crate::error::{Result, TurndownError};
use crate::models::{TURNDOWN_NODE_LABEL, TURNDOWN_NODE_SELECTOR};
use crate::patch::{apply_merge_patch_to, patch_workload};
use crate::settings::TurndownSettings;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, PodSpec, Taint, Toleration};
use kube::ResourceExt;
use serde_json::json;
use std::sync::Arc;
use tracing::info;

/// Name of the cluster DNS deployment in the system namespace
pub const KUBE_DNS: &str = "kube-dns";

const NO_SCHEDULE: &str = "NoSchedule";

#[async_trait]
pub trait TurndownStrategy: Send + Sync {
    /// Return the node that hosts the turndown process, preparing one if
    /// none is labelled yet
    async fn create_or_get_host_node(&self) -> Result<Node>;

    /// Let cluster DNS schedule onto the host node
    async fn allow_kube_dns(&self) -> Result<()>;

    /// Taint key placed on the host node
    fn taint_key(&self) -> &str;
}

/// Add a `NoSchedule`/`Exists` toleration for `key` unless one is present.
///
/// Returns whether the pod spec changed.
pub fn add_toleration(spec: &mut PodSpec, key: &str) -> bool {
    let tolerations = spec.tolerations.get_or_insert_with(Vec::new);
    let present = tolerations
        .iter()
        .any(|t| t.key.as_deref() == Some(key) && t.effect.as_deref() == Some(NO_SCHEDULE));
    if present {
        return false;
    }
    tolerations.push(Toleration {
        key: Some(key.to_string()),
        operator: Some("Exists".to_string()),
        effect: Some(NO_SCHEDULE.to_string()),
        ..Default::default()
    });
    true
}

/// Hosts turndown on the node it is already running on.
///
/// An already labelled node wins. Otherwise the current node is labelled
/// `cluster-turndown-node=true` and tainted so only tolerating pods stay.
pub struct StandardStrategy {
    client: Arc<dyn ClusterClient>,
    current_node: String,
    taint_key: String,
    system_namespace: String,
}

impl StandardStrategy {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        current_node: impl Into<String>,
        taint_key: impl Into<String>,
        system_namespace: impl Into<String>,
    ) -> Self {
        Self {
            client,
            current_node: current_node.into(),
            taint_key: taint_key.into(),
            system_namespace: system_namespace.into(),
        }
    }

    pub fn from_settings(
        client: Arc<dyn ClusterClient>,
        current_node: impl Into<String>,
        settings: &TurndownSettings,
    ) -> Self {
        Self::new(
            client,
            current_node,
            settings.taint_key.clone(),
            settings.system_namespace.clone(),
        )
    }
}

#[async_trait]
impl TurndownStrategy for StandardStrategy {
    async fn create_or_get_host_node(&self) -> Result<Node> {
        let labelled = self.client.list_nodes(Some(TURNDOWN_NODE_SELECTOR)).await?;
        if let Some(node) = labelled.into_iter().next() {
            info!(node = %node.name_any(), "Using existing turndown host node");
            return Ok(node);
        }

        let node = self.client.get_node(&self.current_node).await?;

        // Merge patches replace arrays whole, so send the full taint list
        let mut taints = node
            .spec
            .as_ref()
            .and_then(|s| s.taints.clone())
            .unwrap_or_default();
        if !taints.iter().any(|t| t.key == self.taint_key) {
            taints.push(Taint {
                key: self.taint_key.clone(),
                value: Some("true".to_string()),
                effect: NO_SCHEDULE.to_string(),
                time_added: None,
            });
        }

        let patch = json!({
            "metadata": { "labels": { TURNDOWN_NODE_LABEL: "true" } },
            "spec": { "taints": taints },
        });
        self.client.patch_node(&self.current_node, &patch).await?;

        info!(
            node = %self.current_node,
            taint = %self.taint_key,
            "Labelled and tainted turndown host node"
        );
        apply_merge_patch_to(&node, &patch)
    }

    async fn allow_kube_dns(&self) -> Result<()> {
        let deployment = self
            .client
            .get_deployment(&self.system_namespace, KUBE_DNS)
            .await?;

        let key = self.taint_key.as_str();
        patch_workload(self.client.as_ref(), deployment, |d| {
            let spec = d
                .spec
                .as_mut()
                .and_then(|s| s.template.spec.as_mut())
                .ok_or_else(|| {
                    TurndownError::Strategy(format!("{} has no pod template spec", KUBE_DNS))
                })?;
            Ok(add_toleration(spec, key))
        })
        .await?;

        Ok(())
    }

    fn taint_key(&self) -> &str {
        &self.taint_key
    }
}
