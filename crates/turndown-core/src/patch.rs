//! Mutate-then-diff-then-patch
//!
//! A workload is serialized, mutated in place and serialized again. Only the
//! difference between the two documents is sent to the API server as a JSON
//! merge patch (RFC 7386), so fields edited concurrently by other actors are
//! left alone.

use crate::client::ClusterClient;
use crate::error::{Result, TurndownError};
use crate::models::{PatchTarget, WorkloadKind};
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::batch::v1::CronJob;
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;

/// A namespaced object the patch protocol can address
pub trait Workload:
    Resource<DynamicType = ()> + Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
    const KIND: WorkloadKind;

    fn patch_target(&self) -> PatchTarget {
        PatchTarget {
            kind: Self::KIND,
            namespace: self.namespace().unwrap_or_default(),
            name: self.name_any(),
        }
    }
}

impl Workload for Deployment {
    const KIND: WorkloadKind = WorkloadKind::Deployment;
}

impl Workload for DaemonSet {
    const KIND: WorkloadKind = WorkloadKind::DaemonSet;
}

impl Workload for CronJob {
    const KIND: WorkloadKind = WorkloadKind::CronJob;
}

/// Result of a patch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The mutation changed nothing and no request was sent
    Unchanged,
    /// A merge patch was applied to the live object
    Patched,
}

/// Apply `mutate` to `object` and send the resulting difference as one patch.
///
/// `mutate` reports whether it changed anything; when it did not, no request
/// is made. The object is consumed: after a failed patch the mutated copy no
/// longer matches the live object, so a retry has to start from a fresh read.
pub async fn patch_workload<K, F>(
    client: &dyn ClusterClient,
    mut object: K,
    mutate: F,
) -> Result<PatchOutcome>
where
    K: Workload,
    F: FnOnce(&mut K) -> Result<bool>,
{
    let before = serde_json::to_value(&object)?;
    if !mutate(&mut object)? {
        return Ok(PatchOutcome::Unchanged);
    }
    let after = serde_json::to_value(&object)?;

    let Some(patch) = merge_patch_diff(&before, &after) else {
        return Ok(PatchOutcome::Unchanged);
    };

    let target = object.patch_target();
    debug!(target = %target, patch = %patch, "Patching workload");
    client.patch(&target, &patch).await?;
    Ok(PatchOutcome::Patched)
}

/// Compute the merge patch turning `before` into `after`.
///
/// Returns `None` when the documents are equal. Removed keys become `null`,
/// arrays and scalars are replaced whole.
pub fn merge_patch_diff(before: &Value, after: &Value) -> Option<Value> {
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            let mut patch = Map::new();
            for (key, old_value) in old {
                match new.get(key) {
                    None => {
                        patch.insert(key.clone(), Value::Null);
                    }
                    Some(new_value) => {
                        if let Some(diff) = merge_patch_diff(old_value, new_value) {
                            patch.insert(key.clone(), diff);
                        }
                    }
                }
            }
            for (key, new_value) in new {
                if !old.contains_key(key) {
                    patch.insert(key.clone(), new_value.clone());
                }
            }
            if patch.is_empty() {
                None
            } else {
                Some(Value::Object(patch))
            }
        }
        _ if before == after => None,
        _ => Some(after.clone()),
    }
}

/// Apply a merge patch to a document in place (RFC 7386 section 2)
pub fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(entries) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(map) = target {
        for (key, value) in entries {
            if value.is_null() {
                map.remove(key);
            } else {
                apply_merge_patch(map.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

/// Apply a merge patch to a typed object by round-tripping it through JSON
pub fn apply_merge_patch_to<K>(object: &K, patch: &Value) -> Result<K>
where
    K: Serialize + DeserializeOwned,
{
    let mut document = serde_json::to_value(object)?;
    apply_merge_patch(&mut document, patch);
    serde_json::from_value(document).map_err(TurndownError::from)
}
