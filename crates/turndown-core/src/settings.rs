//! Tunables shared by the turndown components

use serde::Deserialize;
use std::time::Duration;

/// Settings for the flattener, the drainer and the Kubernetes client
#[derive(Debug, Clone, Deserialize)]
pub struct TurndownSettings {
    /// Workload names that are never flattened or expanded
    #[serde(default = "default_flatten_omit")]
    pub flatten_omit: Vec<String>,

    /// Namespace whose deployments also get the safe-to-evict marker
    #[serde(default = "default_system_namespace")]
    pub system_namespace: String,

    /// Namespace of the turndown deployment itself
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Name of the turndown deployment itself
    #[serde(default = "default_deployment_name")]
    pub deployment_name: String,

    /// Node label naming the pool a node belongs to
    #[serde(default = "default_node_pool_label")]
    pub node_pool_label: String,

    /// Taint key placed on the turndown host node
    #[serde(default = "default_taint_key")]
    pub taint_key: String,

    /// Eviction attempts per pod before a drain gives up on it
    #[serde(default = "default_eviction_retries")]
    pub eviction_retries: u32,

    /// Pause between eviction attempts in seconds
    #[serde(default = "default_eviction_backoff_secs")]
    pub eviction_backoff_secs: u64,

    /// Kubernetes API connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Kubernetes API read timeout in seconds
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

fn default_flatten_omit() -> Vec<String> {
    vec![
        "cluster-turndown".to_string(),
        "kube-dns".to_string(),
        "kube-dns-autoscaler".to_string(),
    ]
}

fn default_system_namespace() -> String {
    "kube-system".to_string()
}

fn default_namespace() -> String {
    "turndown".to_string()
}

fn default_deployment_name() -> String {
    "cluster-turndown".to_string()
}

fn default_node_pool_label() -> String {
    "cloud.google.com/gke-nodepool".to_string()
}

fn default_taint_key() -> String {
    "cluster-turndown".to_string()
}

fn default_eviction_retries() -> u32 {
    5
}

fn default_eviction_backoff_secs() -> u64 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_read_timeout_secs() -> u64 {
    60
}

impl Default for TurndownSettings {
    fn default() -> Self {
        Self {
            flatten_omit: default_flatten_omit(),
            system_namespace: default_system_namespace(),
            namespace: default_namespace(),
            deployment_name: default_deployment_name(),
            node_pool_label: default_node_pool_label(),
            taint_key: default_taint_key(),
            eviction_retries: default_eviction_retries(),
            eviction_backoff_secs: default_eviction_backoff_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

impl TurndownSettings {
    pub fn eviction_backoff(&self) -> Duration {
        Duration::from_secs(self.eviction_backoff_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_omit_own_components() {
        let settings = TurndownSettings::default();
        assert!(settings.flatten_omit.contains(&"cluster-turndown".to_string()));
        assert!(settings.flatten_omit.contains(&"kube-dns".to_string()));
        assert_eq!(settings.system_namespace, "kube-system");
    }

    #[test]
    fn test_partial_settings_fill_defaults() {
        let settings: TurndownSettings =
            serde_json::from_str(r#"{"namespace": "ops", "eviction_retries": 2}"#).unwrap();
        assert_eq!(settings.namespace, "ops");
        assert_eq!(settings.eviction_retries, 2);
        assert_eq!(settings.deployment_name, "cluster-turndown");
        assert_eq!(settings.read_timeout(), Duration::from_secs(60));
    }
}
