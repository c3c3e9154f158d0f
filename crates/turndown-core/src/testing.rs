//! In-memory collaborators for exercising the turndown engine without a cluster
//!
//! [`FakeCluster`] stores typed objects and applies merge patches to them the
//! way the API server would, so a flatten/expand cycle can be checked end to
//! end. Clones share state.

use crate::client::ClusterClient;
use crate::drain::Drainer;
use crate::error::{Result, TurndownError};
use crate::models::{NodePool, PatchTarget, WorkloadKind};
use crate::patch::apply_merge_patch_to;
use crate::provider::{ComputeProvider, DEFAULT_POOL};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{
    DaemonSet, DaemonSetSpec, Deployment, DeploymentSpec, DeploymentStrategy,
    RollingUpdateDeployment,
};
use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{Node, Pod, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

type Key = (String, String);

fn key(namespace: &str, name: &str) -> Key {
    (namespace.to_string(), name.to_string())
}

fn object_key<K: ResourceExt>(object: &K) -> Key {
    (object.namespace().unwrap_or_default(), object.name_any())
}

/// A failure the API server would report
pub fn api_error(code: u16, message: impl Into<String>) -> TurndownError {
    TurndownError::Kube(kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message: message.into(),
        reason: "InternalError".to_string(),
        code,
    }))
}

#[derive(Default)]
struct ClusterState {
    nodes: BTreeMap<String, Node>,
    pods: BTreeMap<Key, Pod>,
    deployments: BTreeMap<Key, Deployment>,
    daemon_sets: BTreeMap<Key, DaemonSet>,
    cron_jobs: BTreeMap<Key, CronJob>,
    patches: Vec<String>,
    evicted: Vec<String>,
    refused_evictions: HashMap<String, u32>,
    failing_patches: HashSet<String>,
    failing_lists: HashSet<WorkloadKind>,
    failing_node_list: bool,
}

/// In-memory [`ClusterClient`]
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ClusterState> {
        self.state.lock().expect("fake cluster lock poisoned")
    }

    pub fn add_node(&self, node: Node) {
        self.state().nodes.insert(node.name_any(), node);
    }

    pub fn add_pod(&self, pod: Pod) {
        self.state().pods.insert(object_key(&pod), pod);
    }

    pub fn add_deployment(&self, deployment: Deployment) {
        self.state()
            .deployments
            .insert(object_key(&deployment), deployment);
    }

    pub fn add_daemon_set(&self, daemon_set: DaemonSet) {
        self.state()
            .daemon_sets
            .insert(object_key(&daemon_set), daemon_set);
    }

    pub fn add_cron_job(&self, job: CronJob) {
        self.state().cron_jobs.insert(object_key(&job), job);
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        self.state().nodes.get(name).cloned()
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.state().deployments.get(&key(namespace, name)).cloned()
    }

    pub fn daemon_set(&self, namespace: &str, name: &str) -> Option<DaemonSet> {
        self.state().daemon_sets.get(&key(namespace, name)).cloned()
    }

    pub fn cron_job(&self, namespace: &str, name: &str) -> Option<CronJob> {
        self.state().cron_jobs.get(&key(namespace, name)).cloned()
    }

    /// Patches applied so far, to nodes and workloads alike
    pub fn patch_count(&self) -> usize {
        self.state().patches.len()
    }

    /// Patches applied to objects with the given name
    pub fn patches_for(&self, name: &str) -> usize {
        self.state()
            .patches
            .iter()
            .filter(|p| p.rsplit('/').next() == Some(name))
            .count()
    }

    /// Evicted pods as `namespace/name`, in eviction order
    pub fn evicted(&self) -> Vec<String> {
        self.state().evicted.clone()
    }

    /// Refuse the next `times` evictions of `namespace/name`
    pub fn refuse_evictions(&self, pod: &str, times: u32) {
        self.state()
            .refused_evictions
            .insert(pod.to_string(), times);
    }

    /// Fail every patch sent to a workload with this name
    pub fn fail_patches_for(&self, name: &str) {
        self.state().failing_patches.insert(name.to_string());
    }

    /// Fail listing a workload kind
    pub fn fail_listing(&self, kind: WorkloadKind) {
        self.state().failing_lists.insert(kind);
    }

    /// Fail every node listing
    pub fn fail_node_listing(&self) {
        self.state().failing_node_list = true;
    }

    fn check_listing(&self, kind: WorkloadKind) -> Result<()> {
        if self.state().failing_lists.contains(&kind) {
            return Err(api_error(500, format!("listing {} failed", kind)));
        }
        Ok(())
    }
}

fn patch_stored<K>(objects: &mut BTreeMap<Key, K>, target: &PatchTarget, patch: &Value) -> Result<()>
where
    K: serde::Serialize + serde::de::DeserializeOwned,
{
    let stored = objects
        .get_mut(&key(&target.namespace, &target.name))
        .ok_or_else(|| TurndownError::NotFound {
            kind: target.kind.as_str(),
            namespace: target.namespace.clone(),
            name: target.name.clone(),
        })?;
    *stored = apply_merge_patch_to(stored, patch)?;
    Ok(())
}

fn matches_selector(node: &Node, selector: &str) -> bool {
    selector.split(',').all(|term| match term.split_once('=') {
        Some((k, v)) => node.labels().get(k).map(String::as_str) == Some(v),
        None => node.labels().contains_key(term),
    })
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn list_nodes(&self, label_selector: Option<&str>) -> Result<Vec<Node>> {
        let state = self.state();
        if state.failing_node_list {
            return Err(api_error(503, "node listing unavailable"));
        }
        Ok(state
            .nodes
            .values()
            .filter(|n| label_selector.map_or(true, |s| matches_selector(n, s)))
            .cloned()
            .collect())
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.node(name).ok_or_else(|| TurndownError::NotFound {
            kind: "Node",
            namespace: String::new(),
            name: name.to_string(),
        })
    }

    async fn patch_node(&self, name: &str, patch: &Value) -> Result<()> {
        let mut state = self.state();
        let stored = state
            .nodes
            .get_mut(name)
            .ok_or_else(|| TurndownError::NotFound {
                kind: "Node",
                namespace: String::new(),
                name: name.to_string(),
            })?;
        *stored = apply_merge_patch_to(stored, patch)?;
        state.patches.push(format!("Node/{}", name));
        Ok(())
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        Ok(self
            .state()
            .pods
            .values()
            .filter(|p| {
                p.spec.as_ref().and_then(|s| s.node_name.as_deref()) == Some(node_name)
            })
            .cloned()
            .collect())
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        let id = format!("{}/{}", namespace, name);
        if let Some(remaining) = state.refused_evictions.get_mut(&id) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(api_error(
                    429,
                    "Cannot evict pod as it would violate the pod's disruption budget.",
                ));
            }
        }
        state.pods.remove(&key(namespace, name));
        state.evicted.push(id);
        Ok(())
    }

    async fn list_deployments(&self) -> Result<Vec<Deployment>> {
        self.check_listing(WorkloadKind::Deployment)?;
        Ok(self.state().deployments.values().cloned().collect())
    }

    async fn list_daemon_sets(&self) -> Result<Vec<DaemonSet>> {
        self.check_listing(WorkloadKind::DaemonSet)?;
        Ok(self.state().daemon_sets.values().cloned().collect())
    }

    async fn list_cron_jobs(&self) -> Result<Vec<CronJob>> {
        self.check_listing(WorkloadKind::CronJob)?;
        Ok(self.state().cron_jobs.values().cloned().collect())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        self.deployment(namespace, name)
            .ok_or_else(|| TurndownError::NotFound {
                kind: "Deployment",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn patch(&self, target: &PatchTarget, patch: &Value) -> Result<()> {
        let mut state = self.state();
        if state.failing_patches.contains(&target.name) {
            return Err(api_error(409, format!("conflict patching {}", target)));
        }
        match target.kind {
            WorkloadKind::Deployment => patch_stored(&mut state.deployments, target, patch)?,
            WorkloadKind::DaemonSet => patch_stored(&mut state.daemon_sets, target, patch)?,
            WorkloadKind::CronJob => patch_stored(&mut state.cron_jobs, target, patch)?,
        }
        state
            .patches
            .push(format!("{}/{}/{}", target.kind, target.namespace, target.name));
        Ok(())
    }
}

#[derive(Default)]
struct ProviderState {
    pools: Vec<NodePool>,
    resizes: Vec<(Vec<String>, u32)>,
    resets: Vec<Vec<String>>,
    fail_resize: bool,
    fail_reset: bool,
}

/// [`ComputeProvider`] over a fixed pool list that records resize calls.
///
/// Nodes belong to the pool named by their `pool` label. Like a cloud
/// provider that tags its pools, it remembers the size a pool had before its
/// first resize until the pool is reset.
#[derive(Clone, Default)]
pub struct FakeProvider {
    state: Arc<Mutex<ProviderState>>,
}

/// Node label read by [`FakeProvider::get_pool_id`]
pub const FAKE_POOL_LABEL: &str = "pool";

impl FakeProvider {
    pub fn new(pools: Vec<NodePool>) -> Self {
        let provider = Self::default();
        provider.state().pools = pools;
        provider
    }

    fn state(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().expect("fake provider lock poisoned")
    }

    /// Current size of a pool
    pub fn size_of(&self, name: &str) -> Option<u32> {
        self.state()
            .pools
            .iter()
            .find(|p| p.name == name)
            .map(|p| p.node_count)
    }

    /// Calls to `set_node_pool_sizes` as (pool names, size)
    pub fn resizes(&self) -> Vec<(Vec<String>, u32)> {
        self.state().resizes.clone()
    }

    /// Calls to `reset_node_pool_sizes` as pool names
    pub fn resets(&self) -> Vec<Vec<String>> {
        self.state().resets.clone()
    }

    pub fn fail_resize(&self, fail: bool) {
        self.state().fail_resize = fail;
    }

    pub fn fail_reset(&self, fail: bool) {
        self.state().fail_reset = fail;
    }
}

fn pool_names(pools: &[NodePool]) -> Vec<String> {
    pools.iter().map(|p| p.name.clone()).collect()
}

#[async_trait]
impl ComputeProvider for FakeProvider {
    async fn get_node_pools(&self) -> Result<Vec<NodePool>> {
        Ok(self.state().pools.clone())
    }

    fn get_pool_id(&self, node: &Node) -> String {
        node.labels()
            .get(FAKE_POOL_LABEL)
            .cloned()
            .unwrap_or_else(|| DEFAULT_POOL.to_string())
    }

    async fn set_node_pool_sizes(&self, pools: &[NodePool], size: u32) -> Result<()> {
        let mut state = self.state();
        state.resizes.push((pool_names(pools), size));
        if state.fail_resize {
            return Err(TurndownError::Provider("resize quota exceeded".to_string()));
        }
        for pool in pools {
            if let Some(live) = state.pools.iter_mut().find(|p| p.name == pool.name) {
                live.pre_turndown_count.get_or_insert(live.node_count);
                live.node_count = size;
            }
        }
        Ok(())
    }

    async fn reset_node_pool_sizes(&self, pools: &[NodePool]) -> Result<()> {
        let mut state = self.state();
        state.resets.push(pool_names(pools));
        if state.fail_reset {
            return Err(TurndownError::Provider("reset rejected".to_string()));
        }
        for pool in pools {
            if let Some(live) = state.pools.iter_mut().find(|p| p.name == pool.name) {
                live.node_count = pool.node_count;
                live.pre_turndown_count = None;
            }
        }
        Ok(())
    }
}

/// [`Drainer`] that records drained nodes
#[derive(Clone, Default)]
pub struct FakeDrainer {
    drained: Arc<Mutex<Vec<String>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl FakeDrainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drained(&self) -> Vec<String> {
        self.drained.lock().expect("fake drainer lock poisoned").clone()
    }

    pub fn fail_on(&self, node: &str) {
        self.failing
            .lock()
            .expect("fake drainer lock poisoned")
            .insert(node.to_string());
    }
}

#[async_trait]
impl Drainer for FakeDrainer {
    async fn drain(&self, node_name: &str) -> Result<()> {
        self.drained
            .lock()
            .expect("fake drainer lock poisoned")
            .push(node_name.to_string());
        if self
            .failing
            .lock()
            .expect("fake drainer lock poisoned")
            .contains(node_name)
        {
            return Err(TurndownError::Drain {
                node: node_name.to_string(),
                reason: "eviction blocked".to_string(),
            });
        }
        Ok(())
    }
}

fn meta(namespace: Option<&str>, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        ..Default::default()
    }
}

pub fn node(name: &str, labels: &[(&str, &str)]) -> Node {
    let mut metadata = meta(None, name);
    if !labels.is_empty() {
        metadata.labels = Some(
            labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }
    Node {
        metadata,
        ..Default::default()
    }
}

pub fn pod(namespace: &str, name: &str, node_name: &str) -> Pod {
    Pod {
        metadata: meta(Some(namespace), name),
        spec: Some(PodSpec {
            node_name: Some(node_name.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn pod_template() -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta::default()),
        spec: Some(PodSpec::default()),
    }
}

pub fn pool(name: &str, auto_scaling: bool, node_count: u32) -> NodePool {
    NodePool {
        name: name.to_string(),
        auto_scaling,
        node_count,
        handle: format!("pools/{}", name),
        pre_turndown_count: None,
    }
}

/// Deployment with no strategy set
pub fn deployment(namespace: &str, name: &str, replicas: Option<i32>) -> Deployment {
    Deployment {
        metadata: meta(Some(namespace), name),
        spec: Some(DeploymentSpec {
            replicas,
            template: pod_template(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Deployment with a rolling update strategy
pub fn rolling_deployment(
    namespace: &str,
    name: &str,
    replicas: Option<i32>,
    max_unavailable: Option<IntOrString>,
) -> Deployment {
    let mut d = deployment(namespace, name, replicas);
    if let Some(spec) = d.spec.as_mut() {
        spec.strategy = Some(DeploymentStrategy {
            type_: Some("RollingUpdate".to_string()),
            rolling_update: Some(RollingUpdateDeployment {
                max_unavailable,
                max_surge: None,
            }),
        });
    }
    d
}

pub fn daemon_set(namespace: &str, name: &str) -> DaemonSet {
    DaemonSet {
        metadata: meta(Some(namespace), name),
        spec: Some(DaemonSetSpec {
            template: pod_template(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn cron_job(namespace: &str, name: &str, suspend: Option<bool>) -> CronJob {
    CronJob {
        metadata: meta(Some(namespace), name),
        spec: Some(CronJobSpec {
            schedule: "*/5 * * * *".to_string(),
            suspend,
            job_template: JobTemplateSpec::default(),
            ..Default::default()
        }),
        ..Default::default()
    }
}
