//! Reversible workload flattening
//!
//! Flattening shrinks the scheduling footprint of every Deployment,
//! DaemonSet and CronJob in the cluster so the autoscaler can reclaim
//! nodes. Each value that gets overwritten is first copied into an
//! annotation on the object itself, and expanding replays those
//! annotations to restore the object exactly.

mod capture;
mod fields;


pub use capture::{Capture, MaxUnavailable, PriorMarker};

use crate::client::ClusterClient;
use crate::error::Result;
use crate::observability::TurndownMetrics;
use crate::patch::{patch_workload, PatchOutcome};
use crate::settings::TurndownSettings;
use fields::Flattenable;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::batch::v1::CronJob;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Prefix shared by all capture annotations
pub const ANNOTATION_PREFIX: &str = "turndown.cluster-turndown.io";

/// Captured deployment replica count
pub const REPLICAS_CAPTURE: &str = "turndown.cluster-turndown.io/replicas";

/// Captured rolling-update max-unavailable
pub const ROLLOUT_CAPTURE: &str = "turndown.cluster-turndown.io/rollout-max-unavailable";

/// Captured pod template safe-to-evict marker
pub const SAFE_TO_EVICT_CAPTURE: &str = "turndown.cluster-turndown.io/safe-to-evict";

/// Captured CronJob suspend flag
pub const JOB_SUSPEND_CAPTURE: &str = "turndown.cluster-turndown.io/job-suspend";

/// Pod annotation the cluster autoscaler honours when picking nodes to remove
pub const SAFE_TO_EVICT: &str = "cluster-autoscaler.kubernetes.io/safe-to-evict";

/// Direction of a flattener pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    Flatten,
    Expand,
}

impl Pass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Pass::Flatten => "flatten",
            Pass::Expand => "expand",
        }
    }
}

/// Per-item outcome counts of a best-effort pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlattenReport {
    pub patched: usize,
    pub unchanged: usize,
    pub omitted: usize,
    pub failed: usize,
}

impl FlattenReport {
    pub fn merge(mut self, other: FlattenReport) -> Self {
        self.patched += other.patched;
        self.unchanged += other.unchanged;
        self.omitted += other.omitted;
        self.failed += other.failed;
        self
    }
}

/// Flattens and expands workloads cluster-wide
pub struct Flattener {
    client: Arc<dyn ClusterClient>,
    omit: HashSet<String>,
    system_namespace: String,
    metrics: TurndownMetrics,
}

impl Flattener {
    pub fn new<I, S>(
        client: Arc<dyn ClusterClient>,
        omit: I,
        system_namespace: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            client,
            omit: omit.into_iter().map(Into::into).collect(),
            system_namespace: system_namespace.into(),
            metrics: TurndownMetrics::new(),
        }
    }

    pub fn from_settings(client: Arc<dyn ClusterClient>, settings: &TurndownSettings) -> Self {
        Self::new(
            client,
            settings.flatten_omit.iter().cloned(),
            settings.system_namespace.clone(),
        )
    }

    /// Whether a workload name is on the deny-list
    pub fn is_omitted(&self, name: &str) -> bool {
        self.omit.contains(name)
    }

    /// Flatten deployments and daemon sets and suspend cron jobs
    pub async fn flatten(&self) -> Result<FlattenReport> {
        let report = self.flatten_deployments().await?;
        let report = report.merge(self.flatten_daemon_sets().await?);
        Ok(report.merge(self.suspend_jobs().await?))
    }

    /// Undo [`Flattener::flatten`]
    pub async fn expand(&self) -> Result<FlattenReport> {
        let report = self.expand_deployments().await?;
        let report = report.merge(self.expand_daemon_sets().await?);
        Ok(report.merge(self.resume_jobs().await?))
    }

    pub async fn flatten_deployments(&self) -> Result<FlattenReport> {
        let deployments = self.client.list_deployments().await?;
        Ok(self.run_pass(Pass::Flatten, deployments).await)
    }

    pub async fn expand_deployments(&self) -> Result<FlattenReport> {
        let deployments = self.client.list_deployments().await?;
        Ok(self.run_pass(Pass::Expand, deployments).await)
    }

    pub async fn flatten_daemon_sets(&self) -> Result<FlattenReport> {
        let daemon_sets = self.client.list_daemon_sets().await?;
        Ok(self.run_pass(Pass::Flatten, daemon_sets).await)
    }

    pub async fn expand_daemon_sets(&self) -> Result<FlattenReport> {
        let daemon_sets = self.client.list_daemon_sets().await?;
        Ok(self.run_pass(Pass::Expand, daemon_sets).await)
    }

    pub async fn suspend_jobs(&self) -> Result<FlattenReport> {
        let jobs = self.client.list_cron_jobs().await?;
        Ok(self.run_pass(Pass::Flatten, jobs).await)
    }

    pub async fn resume_jobs(&self) -> Result<FlattenReport> {
        let jobs = self.client.list_cron_jobs().await?;
        Ok(self.run_pass(Pass::Expand, jobs).await)
    }

    pub async fn flatten_deployment(&self, deployment: Deployment) -> Result<PatchOutcome> {
        self.apply(Pass::Flatten, deployment).await
    }

    pub async fn expand_deployment(&self, deployment: Deployment) -> Result<PatchOutcome> {
        self.apply(Pass::Expand, deployment).await
    }

    pub async fn flatten_daemon_set(&self, daemon_set: DaemonSet) -> Result<PatchOutcome> {
        self.apply(Pass::Flatten, daemon_set).await
    }

    pub async fn expand_daemon_set(&self, daemon_set: DaemonSet) -> Result<PatchOutcome> {
        self.apply(Pass::Expand, daemon_set).await
    }

    pub async fn suspend_job(&self, job: CronJob) -> Result<PatchOutcome> {
        self.apply(Pass::Flatten, job).await
    }

    pub async fn resume_job(&self, job: CronJob) -> Result<PatchOutcome> {
        self.apply(Pass::Expand, job).await
    }

    async fn apply<K: Flattenable>(&self, pass: Pass, object: K) -> Result<PatchOutcome> {
        let system_namespace = self.system_namespace.as_str();
        patch_workload(self.client.as_ref(), object, |o| match pass {
            Pass::Flatten => Ok(o.flatten_in_place(system_namespace)),
            Pass::Expand => o.expand_in_place(system_namespace),
        })
        .await
    }

    /// Apply a pass to every item, logging and counting failures
    async fn run_pass<K: Flattenable>(&self, pass: Pass, items: Vec<K>) -> FlattenReport {
        let mut report = FlattenReport::default();

        for item in items {
            let target = item.patch_target();
            if self.is_omitted(&target.name) {
                debug!(target = %target, "Skipping omitted workload");
                report.omitted += 1;
                continue;
            }

            match self.apply(pass, item).await {
                Ok(PatchOutcome::Patched) => {
                    debug!(target = %target, pass = pass.as_str(), "Workload patched");
                    self.metrics.inc_workloads_patched(K::KIND, pass.as_str());
                    report.patched += 1;
                }
                Ok(PatchOutcome::Unchanged) => report.unchanged += 1,
                Err(e) => {
                    warn!(
                        target = %target,
                        pass = pass.as_str(),
                        error = %e,
                        "Failed to patch workload, continuing"
                    );
                    self.metrics.inc_workload_failures(K::KIND, pass.as_str());
                    report.failed += 1;
                }
            }
        }

        info!(
            kind = %K::KIND,
            pass = pass.as_str(),
            patched = report.patched,
            unchanged = report.unchanged,
            omitted = report.omitted,
            failed = report.failed,
            "Finished workload pass"
        );
        report
    }
}
