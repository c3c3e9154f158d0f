//! Core data models for cluster turndown

use serde::{Deserialize, Serialize};

/// Label marking the node that hosts the turndown process
pub const TURNDOWN_NODE_LABEL: &str = "cluster-turndown-node";

/// Label selector matching the turndown host node
pub const TURNDOWN_NODE_SELECTOR: &str = "cluster-turndown-node=true";

/// A group of identically configured nodes, as reported by the compute provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodePool {
    pub name: String,
    pub auto_scaling: bool,
    /// Node count at the time the pool was enumerated
    pub node_count: u32,
    /// Provider-specific identifier used for resize calls
    pub handle: String,
    /// Size from before a turndown resize, for providers that remember it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_turndown_count: Option<u32>,
}

impl NodePool {
    /// Size scale-up should bring the pool back to
    pub fn restore_size(&self) -> u32 {
        self.pre_turndown_count.unwrap_or(self.node_count)
    }
}

/// A cluster node as seen by the turndown manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterNode {
    pub name: String,
    pub pool_id: String,
    /// Whether this node hosts the turndown process
    pub is_anchor: bool,
}

/// Everything scale-up needs to undo a scale-down.
///
/// The manager keeps one in memory between the two calls. It serializes to
/// JSON so a caller can persist it and hand it back after a restart.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurndownRecord {
    /// Pools resized to zero, with the size scale-up restores
    pub target_pools: Vec<NodePool>,
    /// Pools chosen for shrinking whose resize has not succeeded yet
    #[serde(default)]
    pub pending_pools: Vec<NodePool>,
    pub was_auto_scaling: bool,
    pub scaled_down_at: i64,
}

impl TurndownRecord {
    pub fn new(was_auto_scaling: bool) -> Self {
        Self {
            target_pools: Vec::new(),
            pending_pools: Vec::new(),
            was_auto_scaling,
            scaled_down_at: chrono::Utc::now().timestamp(),
        }
    }

    /// True when scale-up has pools to reset or workloads to expand
    pub fn has_work(&self) -> bool {
        !self.target_pools.is_empty() || !self.pending_pools.is_empty() || self.was_auto_scaling
    }

    pub fn contains_pool(&self, name: &str) -> bool {
        self.all_pools().any(|p| p.name == name)
    }

    /// Resized and pending pools alike
    pub fn all_pools(&self) -> impl Iterator<Item = &NodePool> {
        self.target_pools.iter().chain(&self.pending_pools)
    }

    pub fn pool_names(&self) -> Vec<&str> {
        self.all_pools().map(|p| p.name.as_str()).collect()
    }

    /// Move pending pools to the targets once the provider shrank them
    pub fn mark_resized(&mut self) {
        let resized = std::mem::take(&mut self.pending_pools);
        self.target_pools.extend(resized);
    }
}

/// Workload kinds managed by the flattener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    DaemonSet,
    CronJob,
}

impl WorkloadKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadKind::Deployment => "Deployment",
            WorkloadKind::DaemonSet => "DaemonSet",
            WorkloadKind::CronJob => "CronJob",
        }
    }
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address of a live object a patch is sent to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PatchTarget {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
}

impl std::fmt::Display for PatchTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}/{}", self.kind, self.namespace, self.name)
    }
}
