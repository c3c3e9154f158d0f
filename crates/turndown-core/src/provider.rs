//! Compute provider abstraction
//!
//! A provider enumerates the cluster's node pools and resizes them. Vendor
//! node-pool APIs plug in behind [`ComputeProvider`].

use crate::client::ClusterClient;
use crate::error::{Result, TurndownError};
use crate::models::NodePool;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Pool id reported for nodes without a pool label
pub const DEFAULT_POOL: &str = "default";

/// Trait for node pool management implementations
#[async_trait]
pub trait ComputeProvider: Send + Sync {
    /// Enumerate the cluster's node pools with their current sizes.
    ///
    /// Providers that remember a pool's size from before a turndown resize
    /// report it in [`NodePool::pre_turndown_count`]; scale-up relies on it
    /// when it has to rebuild its record.
    async fn get_node_pools(&self) -> Result<Vec<NodePool>>;

    /// Id of the pool a node belongs to, matching [`NodePool::name`]
    fn get_pool_id(&self, node: &Node) -> String;

    /// Resize every listed pool to `size`
    async fn set_node_pool_sizes(&self, pools: &[NodePool], size: u32) -> Result<()>;

    /// Return every listed pool to its recorded `node_count`
    async fn reset_node_pool_sizes(&self, pools: &[NodePool]) -> Result<()>;
}

/// Provider for clusters whose pools are all sized by the cluster autoscaler.
///
/// Pools are derived from a node label. Every pool reports autoscaling, so
/// scale-down flattens workloads and never asks for a resize; a resize
/// request for any pool is an error.
pub struct AutoscalerManagedProvider {
    client: Arc<dyn ClusterClient>,
    pool_label: String,
}

impl AutoscalerManagedProvider {
    pub fn new(client: Arc<dyn ClusterClient>, pool_label: impl Into<String>) -> Self {
        Self {
            client,
            pool_label: pool_label.into(),
        }
    }

    fn unsupported(pools: &[NodePool]) -> TurndownError {
        let names: Vec<&str> = pools.iter().map(|p| p.name.as_str()).collect();
        TurndownError::Provider(format!(
            "node pools {:?} are autoscaler-managed and cannot be resized directly",
            names
        ))
    }
}

#[async_trait]
impl ComputeProvider for AutoscalerManagedProvider {
    async fn get_node_pools(&self) -> Result<Vec<NodePool>> {
        let nodes = self.client.list_nodes(None).await?;

        let mut counts: BTreeMap<String, u32> = BTreeMap::new();
        for node in &nodes {
            *counts.entry(self.get_pool_id(node)).or_default() += 1;
        }

        debug!(pools = counts.len(), nodes = nodes.len(), "Derived node pools from labels");

        Ok(counts
            .into_iter()
            .map(|(name, node_count)| NodePool {
                handle: name.clone(),
                name,
                auto_scaling: true,
                node_count,
                pre_turndown_count: None,
            })
            .collect())
    }

    fn get_pool_id(&self, node: &Node) -> String {
        node.metadata
            .labels
            .as_ref()
            .and_then(|labels| labels.get(&self.pool_label))
            .cloned()
            .unwrap_or_else(|| DEFAULT_POOL.to_string())
    }

    async fn set_node_pool_sizes(&self, pools: &[NodePool], _size: u32) -> Result<()> {
        if pools.is_empty() {
            return Ok(());
        }
        Err(Self::unsupported(pools))
    }

    async fn reset_node_pool_sizes(&self, pools: &[NodePool]) -> Result<()> {
        if pools.is_empty() {
            return Ok(());
        }
        Err(Self::unsupported(pools))
    }
}
