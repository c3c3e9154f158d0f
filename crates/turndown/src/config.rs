//! Process configuration

use anyhow::{Context, Result};
use serde::Deserialize;
use turndown_core::TurndownSettings;

/// Turndown process configuration.
///
/// Read from `TURNDOWN_*` environment variables; nested settings use a
/// double underscore, e.g. `TURNDOWN_SETTINGS__EVICTION_RETRIES=3`.
#[derive(Debug, Clone, Deserialize)]
pub struct TurndownConfig {
    /// Node name from Kubernetes downward API
    #[serde(default = "default_node_name")]
    pub node_name: String,

    /// API server port for health/metrics
    #[serde(default = "default_api_port")]
    pub api_port: u16,

    #[serde(default)]
    pub settings: TurndownSettings,
}

fn default_node_name() -> String {
    std::env::var("NODE_NAME").unwrap_or_else(|_| "unknown".to_string())
}

fn default_api_port() -> u16 {
    9731
}

impl TurndownConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(
                config::Environment::with_prefix("TURNDOWN")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("settings.flatten_omit"),
            )
            .build()?;

        config
            .try_deserialize()
            .context("Invalid TURNDOWN_* configuration")
    }
}
