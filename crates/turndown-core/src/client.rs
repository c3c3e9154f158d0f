//! Kubernetes API access used by the turndown components
//!
//! Everything the flattener, drainer and strategy need from the API server
//! goes through [`ClusterClient`], so the engine can run against an
//! in-memory cluster in tests.

use crate::error::Result;
use crate::models::{PatchTarget, WorkloadKind};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, EvictParams, ListParams, Patch, PatchParams};
use kube::Client;
use serde_json::Value;
use tracing::debug;

/// Trait for the cluster operations the turndown engine relies on
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List nodes, optionally filtered by a label selector
    async fn list_nodes(&self, label_selector: Option<&str>) -> Result<Vec<Node>>;

    async fn get_node(&self, name: &str) -> Result<Node>;

    /// Apply a JSON merge patch to a node
    async fn patch_node(&self, name: &str, patch: &Value) -> Result<()>;

    /// List all pods scheduled on a node
    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>>;

    /// Evict a pod through the eviction subresource. A pod that no longer
    /// exists counts as evicted.
    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<()>;

    async fn list_deployments(&self) -> Result<Vec<Deployment>>;

    async fn list_daemon_sets(&self) -> Result<Vec<DaemonSet>>;

    async fn list_cron_jobs(&self) -> Result<Vec<CronJob>>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment>;

    /// Apply a JSON merge patch to a workload
    async fn patch(&self, target: &PatchTarget, patch: &Value) -> Result<()>;
}

/// [`ClusterClient`] backed by a live `kube::Client`
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn merge_patch<K>(api: Api<K>, name: &str, patch: &Value) -> Result<()>
    where
        K: Clone + serde::de::DeserializeOwned + std::fmt::Debug,
    {
        api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn list_nodes(&self, label_selector: Option<&str>) -> Result<Vec<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        let params = match label_selector {
            Some(selector) => ListParams::default().labels(selector),
            None => ListParams::default(),
        };
        Ok(api.list(&params).await?.items)
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get(name).await?)
    }

    async fn patch_node(&self, name: &str, patch: &Value) -> Result<()> {
        Self::merge_patch(Api::<Node>::all(self.client.clone()), name, patch).await
    }

    async fn list_pods_on_node(&self, node_name: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = ListParams::default().fields(&format!("spec.nodeName={}", node_name));
        Ok(api.list(&params).await?.items)
    }

    async fn evict_pod(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        match api.evict(name, &EvictParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => {
                debug!(namespace = %namespace, pod = %name, "Pod already gone");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_deployments(&self) -> Result<Vec<Deployment>> {
        let api: Api<Deployment> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_daemon_sets(&self) -> Result<Vec<DaemonSet>> {
        let api: Api<DaemonSet> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_cron_jobs(&self) -> Result<Vec<CronJob>> {
        let api: Api<CronJob> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get(name).await?)
    }

    async fn patch(&self, target: &PatchTarget, patch: &Value) -> Result<()> {
        let client = self.client.clone();
        let ns = target.namespace.as_str();
        match target.kind {
            WorkloadKind::Deployment => {
                Self::merge_patch(Api::<Deployment>::namespaced(client, ns), &target.name, patch)
                    .await
            }
            WorkloadKind::DaemonSet => {
                Self::merge_patch(Api::<DaemonSet>::namespaced(client, ns), &target.name, patch)
                    .await
            }
            WorkloadKind::CronJob => {
                Self::merge_patch(Api::<CronJob>::namespaced(client, ns), &target.name, patch)
                    .await
            }
        }
    }
}

/// Build a `kube::Client` from the ambient configuration (in-cluster service
/// account or kubeconfig) with bounded connect and read timeouts
pub async fn connect(
    connect_timeout: std::time::Duration,
    read_timeout: std::time::Duration,
) -> Result<Client> {
    let mut config = kube::Config::infer()
        .await
        .map_err(kube::Error::InferConfig)?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Ok(Client::try_from(config)?)
}
