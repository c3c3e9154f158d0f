//! Turndown manager
//!
//! Decides what to shrink and in which order. Scale-down flattens or
//! suspends workloads, drains fixed-size nodes and resizes fixed pools to
//! zero; scale-up walks the same steps backwards from the
//! [`TurndownRecord`] scale-down left behind.

#[cfg(test)]
mod tests;

use crate::client::ClusterClient;
use crate::drain::Drainer;
use crate::error::{Result, TurndownError};
use crate::flatten::Flattener;
use crate::health::{components, HealthRegistry};
use crate::models::{
    ClusterNode, NodePool, TurndownRecord, TURNDOWN_NODE_LABEL, TURNDOWN_NODE_SELECTOR,
};
use crate::observability::{TurndownLogger, TurndownMetrics};
use crate::patch::patch_workload;
use crate::provider::ComputeProvider;
use crate::settings::TurndownSettings;
use crate::strategy::{add_toleration, TurndownStrategy};
use kube::ResourceExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Drives a cluster between its normal and scaled-down states
pub struct TurndownManager {
    client: Arc<dyn ClusterClient>,
    provider: Arc<dyn ComputeProvider>,
    strategy: Arc<dyn TurndownStrategy>,
    drainer: Arc<dyn Drainer>,
    flattener: Flattener,
    namespace: String,
    deployment_name: String,
    current_node: String,
    record: Option<TurndownRecord>,
    health: Option<HealthRegistry>,
    metrics: TurndownMetrics,
    logger: TurndownLogger,
}

impl TurndownManager {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        provider: Arc<dyn ComputeProvider>,
        strategy: Arc<dyn TurndownStrategy>,
        drainer: Arc<dyn Drainer>,
        current_node: impl Into<String>,
        settings: &TurndownSettings,
    ) -> Self {
        let current_node = current_node.into();
        Self {
            flattener: Flattener::from_settings(client.clone(), settings),
            client,
            provider,
            strategy,
            drainer,
            namespace: settings.namespace.clone(),
            deployment_name: settings.deployment_name.clone(),
            logger: TurndownLogger::new(current_node.clone()),
            current_node,
            record: None,
            health: None,
            metrics: TurndownMetrics::new(),
        }
    }

    /// Report transition outcomes to the `kubernetes`, `provider` and
    /// `environment` health components
    pub fn with_health(mut self, registry: HealthRegistry) -> Self {
        self.health = Some(registry);
        self
    }

    /// True while a held record still has pools or workloads to restore
    pub fn is_scaled_down(&self) -> bool {
        self.record.as_ref().map_or(false, TurndownRecord::has_work)
    }

    /// The state scale-up will restore from, if any
    pub fn record(&self) -> Option<&TurndownRecord> {
        self.record.as_ref()
    }

    /// Replace the held record, e.g. with one persisted before a restart
    pub fn restore_record(&mut self, record: TurndownRecord) {
        info!(
            target_pools = ?record.pool_names(),
            was_auto_scaling = record.was_auto_scaling,
            "Restored turndown record"
        );
        self.record = Some(record);
        self.update_gauges();
    }

    pub fn current_node(&self) -> &str {
        &self.current_node
    }

    /// Whether this process runs on the labelled turndown host node
    pub async fn is_running_on_turndown_node(&self) -> Result<bool> {
        let nodes = self.client.list_nodes(Some(TURNDOWN_NODE_SELECTOR)).await?;
        Ok(nodes
            .first()
            .map_or(false, |n| n.name_any() == self.current_node))
    }

    /// Pick the host node, let DNS follow it and pin this deployment there.
    ///
    /// Safe to run on every start; nothing is patched once in place.
    pub async fn prepare_turndown_environment(&self) -> Result<()> {
        let start = Instant::now();
        let result = self.prepare().await;
        self.metrics
            .observe_transition("prepare", result.is_ok(), start.elapsed().as_secs_f64());

        if let Some(health) = &self.health {
            match &result {
                Ok(()) => health.set_healthy(components::ENVIRONMENT).await,
                Err(e) => health.set_unhealthy(components::ENVIRONMENT, e.to_string()).await,
            }
        }
        self.report_health(&result, false).await;
        result
    }

    async fn prepare(&self) -> Result<()> {
        let host = self.strategy.create_or_get_host_node().await?;
        debug!(host_node = %host.name_any(), "Turndown host node ready");

        self.strategy.allow_kube_dns().await?;

        let deployment = self
            .client
            .get_deployment(&self.namespace, &self.deployment_name)
            .await?;
        let taint_key = self.strategy.taint_key();
        let name = self.deployment_name.as_str();

        patch_workload(self.client.as_ref(), deployment, |d| {
            let spec = d
                .spec
                .as_mut()
                .and_then(|s| s.template.spec.as_mut())
                .ok_or_else(|| {
                    TurndownError::Strategy(format!("deployment {} has no pod template spec", name))
                })?;

            let mut changed = add_toleration(spec, taint_key);
            let selector = BTreeMap::from([(TURNDOWN_NODE_LABEL.to_string(), "true".to_string())]);
            if spec.node_selector.as_ref() != Some(&selector) {
                spec.node_selector = Some(selector);
                changed = true;
            }
            Ok(changed)
        })
        .await?;

        self.logger.log_environment_prepared(&host.name_any());
        Ok(())
    }

    /// Shrink the cluster, recording what scale-up needs to undo it
    pub async fn scale_down_cluster(&mut self) -> Result<()> {
        let start = Instant::now();
        let result = self.scale_down().await;
        self.metrics
            .observe_transition("scale_down", result.is_ok(), start.elapsed().as_secs_f64());
        self.update_gauges();
        self.report_health(&result, true).await;
        result
    }

    async fn scale_down(&mut self) -> Result<()> {
        let nodes = self.client.list_nodes(None).await?;
        let pools = self.provider.get_node_pools().await?;
        let auto_scaling = pools.iter().any(|p| p.auto_scaling);

        if auto_scaling {
            self.flattener.flatten().await?;
        } else {
            self.flattener.suspend_jobs().await?;
        }

        let nodes: Vec<ClusterNode> = nodes
            .iter()
            .map(|n| ClusterNode {
                name: n.name_any(),
                pool_id: self.provider.get_pool_id(n),
                is_anchor: n.name_any() == self.current_node,
            })
            .collect();
        let drained = self.drain_fixed_nodes(&nodes, &pools).await;

        let anchor_pool = nodes.iter().find(|n| n.is_anchor).map(|n| n.pool_id.as_str());
        let targets = pools
            .iter()
            .filter(|p| !p.auto_scaling && Some(p.name.as_str()) != anchor_pool);

        let mut record = self
            .record
            .take()
            .unwrap_or_else(|| TurndownRecord::new(auto_scaling));
        record.was_auto_scaling |= auto_scaling;

        // Pools from an earlier scale-down keep their original size. Pending
        // ones failed to resize last time and are shrunk again.
        let new_targets: Vec<NodePool> = targets
            .filter(|p| !record.contains_pool(&p.name))
            .map(|p| NodePool {
                node_count: p.restore_size(),
                ..p.clone()
            })
            .collect();
        record.pending_pools.extend(new_targets);
        let pending = record.pending_pools.clone();
        self.record = Some(record);

        if !pending.is_empty() {
            if let Err(e) = self.provider.set_node_pool_sizes(&pending, 0).await {
                let names: Vec<&str> = pending.iter().map(|p| p.name.as_str()).collect();
                self.metrics.inc_resize_failures();
                self.logger.log_resize_failure(&names, Some(0), &e.to_string());
                return Err(e);
            }
            if let Some(record) = self.record.as_mut() {
                record.mark_resized();
            }
        }

        if let Some(record) = &self.record {
            self.logger
                .log_scale_down(auto_scaling, &record.pool_names(), drained);
        }
        Ok(())
    }

    /// Drain every node outside the anchor and autoscaling pools, returning
    /// how many drained cleanly
    async fn drain_fixed_nodes(&self, nodes: &[ClusterNode], pools: &[NodePool]) -> usize {
        let by_name: HashMap<&str, &NodePool> =
            pools.iter().map(|p| (p.name.as_str(), p)).collect();
        let mut drained = 0;

        for node in nodes.iter().filter(|n| !n.is_anchor) {
            let Some(pool) = by_name.get(node.pool_id.as_str()) else {
                warn!(node = %node.name, pool_id = %node.pool_id, "Node pool not found, skipping");
                continue;
            };
            if pool.auto_scaling {
                continue;
            }

            debug!(node = %node.name, pool = %pool.name, "Draining node");
            match self.drainer.drain(&node.name).await {
                Ok(()) => drained += 1,
                Err(e) => {
                    self.metrics.inc_drain_failures();
                    self.logger.log_drain_failure(&node.name, &e.to_string());
                }
            }
        }

        drained
    }

    /// Restore the cluster from the held record, rebuilding it from the
    /// provider when none is held
    pub async fn scale_up_cluster(&mut self) -> Result<()> {
        let start = Instant::now();
        let result = self.scale_up().await;
        self.metrics
            .observe_transition("scale_up", result.is_ok(), start.elapsed().as_secs_f64());
        self.update_gauges();
        self.report_health(&result, true).await;
        result
    }

    async fn scale_up(&mut self) -> Result<()> {
        let record = match self.record.take().filter(TurndownRecord::has_work) {
            Some(record) => record,
            None => self.load_record().await?,
        };
        if !record.has_work() {
            return Err(TurndownError::NothingToRestore);
        }

        let pools: Vec<NodePool> = record.all_pools().cloned().collect();
        if !pools.is_empty() {
            if let Err(e) = self.provider.reset_node_pool_sizes(&pools).await {
                self.metrics.inc_resize_failures();
                self.logger
                    .log_resize_failure(&record.pool_names(), None, &e.to_string());
                self.record = Some(record);
                return Err(e);
            }
        }

        let expanded = if record.was_auto_scaling {
            self.flattener.expand().await
        } else {
            self.flattener.resume_jobs().await
        };
        if let Err(e) = expanded {
            self.record = Some(record);
            return Err(e);
        }

        // Drained nodes were removed and come back fresh, so nothing to uncordon
        self.logger
            .log_scale_up(record.was_auto_scaling, &record.pool_names());
        Ok(())
    }

    /// Rebuild a record from the provider's pools.
    ///
    /// Fixed pools are restored to the size the provider remembers from
    /// before turndown. An empty pool without one cannot be restored, so the
    /// rebuild fails rather than resetting it to zero.
    async fn load_record(&self) -> Result<TurndownRecord> {
        let pools = self.provider.get_node_pools().await?;
        let mut record = TurndownRecord::new(pools.iter().any(|p| p.auto_scaling));
        record.target_pools = pools
            .into_iter()
            .filter(|p| !p.auto_scaling)
            .map(|p| NodePool {
                node_count: p.restore_size(),
                ..p
            })
            .collect();

        let unknown: Vec<String> = record
            .target_pools
            .iter()
            .filter(|p| p.node_count == 0)
            .map(|p| p.name.clone())
            .collect();
        if !unknown.is_empty() {
            return Err(TurndownError::UnknownPoolSize(unknown));
        }

        info!(
            target_pools = ?record.pool_names(),
            was_auto_scaling = record.was_auto_scaling,
            "No turndown record held, rebuilt from provider"
        );
        Ok(record)
    }

    fn update_gauges(&self) {
        let pools = self.record.as_ref().map_or(0, |r| r.all_pools().count());
        self.metrics.set_scaled_down(self.is_scaled_down(), pools);
    }

    /// `provider_used` is false for transitions that never call the provider
    async fn report_health(&self, result: &Result<()>, provider_used: bool) {
        let Some(health) = &self.health else {
            return;
        };
        match result {
            Ok(()) => {
                health.set_healthy(components::KUBERNETES).await;
                if provider_used {
                    health.set_healthy(components::PROVIDER).await;
                }
            }
            Err(e @ (TurndownError::Provider(_) | TurndownError::UnknownPoolSize(_))) => {
                health.set_degraded(components::PROVIDER, e.to_string()).await;
            }
            Err(
                e @ (TurndownError::Kube(_)
                | TurndownError::NotFound { .. }
                | TurndownError::Serialization(_)),
            ) => {
                health.set_degraded(components::KUBERNETES, e.to_string()).await;
            }
            Err(_) => {}
        }
    }
}
