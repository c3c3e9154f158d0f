//! Reversible field transforms for each workload kind
//!
//! Every flattenable field is one [`ReversibleField`]: it says what to
//! capture before flattening, how to flatten, and how to restore from the
//! captured value. [`flatten_field`] and [`expand_field`] own the annotation
//! bookkeeping so the per-field code never touches the undo log directly.

use super::capture::{Capture, MaxUnavailable, PriorMarker};
use super::{
    JOB_SUSPEND_CAPTURE, REPLICAS_CAPTURE, ROLLOUT_CAPTURE, SAFE_TO_EVICT, SAFE_TO_EVICT_CAPTURE,
};
use crate::error::{Result, TurndownError};
use crate::patch::Workload;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment, RollingUpdateDeployment};
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

/// What flattening a field should do
pub(crate) enum Flatten<V> {
    /// Field is already flat
    Skip,
    /// Flatten it, storing the value when there is one worth keeping
    Apply(Option<V>),
}

pub(crate) trait ReversibleField<K: Workload> {
    type Value: Capture;

    /// Annotation holding the captured value, `None` for fields that are
    /// restored without one
    const CAPTURE_KEY: Option<&'static str>;

    fn capture(&self, object: &K) -> Flatten<Self::Value>;

    fn apply(&self, object: &mut K);

    /// Restore the field; `captured` is `None` when no capture annotation exists
    fn restore(&self, object: &mut K, captured: Option<Self::Value>) -> bool;
}

/// Flatten one field, returning whether the object changed.
///
/// An existing capture annotation means an earlier pass already flattened
/// the field and has not been reversed yet.
pub(crate) fn flatten_field<K, F>(field: &F, object: &mut K) -> bool
where
    K: Workload,
    F: ReversibleField<K>,
{
    if let Some(key) = F::CAPTURE_KEY {
        if object.annotations().contains_key(key) {
            return false;
        }
    }

    match field.capture(object) {
        Flatten::Skip => false,
        Flatten::Apply(captured) => {
            if let (Some(key), Some(value)) = (F::CAPTURE_KEY, captured) {
                object
                    .annotations_mut()
                    .insert(key.to_string(), value.encode());
            }
            field.apply(object);
            true
        }
    }
}

/// Restore one field from its capture annotation and delete the annotation
pub(crate) fn expand_field<K, F>(field: &F, object: &mut K) -> Result<bool>
where
    K: Workload,
    F: ReversibleField<K>,
{
    let captured = match F::CAPTURE_KEY {
        Some(key) => match object.annotations().get(key) {
            Some(raw) => Some(F::Value::decode(raw).map_err(|reason| {
                TurndownError::InvalidCapture {
                    key,
                    value: raw.clone(),
                    reason,
                }
            })?),
            None => None,
        },
        None => None,
    };

    let had_capture = captured.is_some();
    let mut changed = field.restore(object, captured);

    if let (true, Some(key)) = (had_capture, F::CAPTURE_KEY) {
        object.annotations_mut().remove(key);
        changed = true;
    }

    Ok(changed)
}

fn template_marker(template: &PodTemplateSpec) -> Option<&String> {
    template
        .metadata
        .as_ref()?
        .annotations
        .as_ref()?
        .get(SAFE_TO_EVICT)
}

fn set_template_marker(template: &mut PodTemplateSpec, value: String) {
    template
        .metadata
        .get_or_insert_with(Default::default)
        .annotations
        .get_or_insert_with(Default::default)
        .insert(SAFE_TO_EVICT.to_string(), value);
}

fn remove_template_marker(template: &mut PodTemplateSpec) -> bool {
    template
        .metadata
        .as_mut()
        .and_then(|m| m.annotations.as_mut())
        .and_then(|a| a.remove(SAFE_TO_EVICT))
        .is_some()
}

/// Pod template safe-to-evict marker on deployments, previous value captured
pub(crate) struct DeploymentSafeToEvict;

impl ReversibleField<Deployment> for DeploymentSafeToEvict {
    type Value = PriorMarker;
    const CAPTURE_KEY: Option<&'static str> = Some(SAFE_TO_EVICT_CAPTURE);

    fn capture(&self, object: &Deployment) -> Flatten<PriorMarker> {
        let Some(spec) = object.spec.as_ref() else {
            return Flatten::Skip;
        };
        let prior = match template_marker(&spec.template) {
            Some(value) => PriorMarker::Value(value.clone()),
            None => PriorMarker::Absent,
        };
        Flatten::Apply(Some(prior))
    }

    fn apply(&self, object: &mut Deployment) {
        if let Some(spec) = object.spec.as_mut() {
            set_template_marker(&mut spec.template, "true".to_string());
        }
    }

    fn restore(&self, object: &mut Deployment, captured: Option<PriorMarker>) -> bool {
        let (Some(prior), Some(spec)) = (captured, object.spec.as_mut()) else {
            return false;
        };
        match prior {
            PriorMarker::Absent => remove_template_marker(&mut spec.template),
            PriorMarker::Value(value) => {
                set_template_marker(&mut spec.template, value);
                true
            }
        }
    }
}

/// Deployment replica count, zeroed
pub(crate) struct Replicas;

impl ReversibleField<Deployment> for Replicas {
    type Value = i32;
    const CAPTURE_KEY: Option<&'static str> = Some(REPLICAS_CAPTURE);

    fn capture(&self, object: &Deployment) -> Flatten<i32> {
        let Some(spec) = object.spec.as_ref() else {
            return Flatten::Skip;
        };
        // The API server defaults an unset count to 1
        match spec.replicas.unwrap_or(1) {
            0 => Flatten::Skip,
            current => Flatten::Apply(Some(current)),
        }
    }

    fn apply(&self, object: &mut Deployment) {
        if let Some(spec) = object.spec.as_mut() {
            spec.replicas = Some(0);
        }
    }

    fn restore(&self, object: &mut Deployment, captured: Option<i32>) -> bool {
        let (Some(replicas), Some(spec)) = (captured, object.spec.as_mut()) else {
            return false;
        };
        spec.replicas = Some(replicas);
        true
    }
}

/// Rolling-update `maxUnavailable`, forced to 1 so the deployment can still roll
pub(crate) struct RolloutMaxUnavailable;

impl ReversibleField<Deployment> for RolloutMaxUnavailable {
    type Value = MaxUnavailable;
    const CAPTURE_KEY: Option<&'static str> = Some(ROLLOUT_CAPTURE);

    fn capture(&self, object: &Deployment) -> Flatten<MaxUnavailable> {
        let rolling_update = object
            .spec
            .as_ref()
            .and_then(|s| s.strategy.as_ref())
            .and_then(|s| s.rolling_update.as_ref());
        match rolling_update {
            None => Flatten::Skip,
            Some(rolling_update) => {
                Flatten::Apply(Some(MaxUnavailable(rolling_update.max_unavailable.clone())))
            }
        }
    }

    fn apply(&self, object: &mut Deployment) {
        if let Some(rolling_update) = object
            .spec
            .as_mut()
            .and_then(|s| s.strategy.as_mut())
            .and_then(|s| s.rolling_update.as_mut())
        {
            rolling_update.max_unavailable = Some(IntOrString::Int(1));
        }
    }

    fn restore(&self, object: &mut Deployment, captured: Option<MaxUnavailable>) -> bool {
        let (Some(MaxUnavailable(previous)), Some(spec)) = (captured, object.spec.as_mut()) else {
            return false;
        };
        let rolling_update = spec
            .strategy
            .get_or_insert_with(Default::default)
            .rolling_update
            .get_or_insert_with(RollingUpdateDeployment::default);
        rolling_update.max_unavailable = previous;
        true
    }
}

/// Pod template safe-to-evict marker on daemon sets.
///
/// Nothing is captured: expand removes the marker whoever set it.
pub(crate) struct DaemonSetSafeToEvict;

impl ReversibleField<DaemonSet> for DaemonSetSafeToEvict {
    type Value = ();
    const CAPTURE_KEY: Option<&'static str> = None;

    fn capture(&self, object: &DaemonSet) -> Flatten<()> {
        let Some(spec) = object.spec.as_ref() else {
            return Flatten::Skip;
        };
        match template_marker(&spec.template) {
            Some(value) if value == "true" => Flatten::Skip,
            _ => Flatten::Apply(None),
        }
    }

    fn apply(&self, object: &mut DaemonSet) {
        if let Some(spec) = object.spec.as_mut() {
            set_template_marker(&mut spec.template, "true".to_string());
        }
    }

    fn restore(&self, object: &mut DaemonSet, _captured: Option<()>) -> bool {
        match object.spec.as_mut() {
            Some(spec) => remove_template_marker(&mut spec.template),
            None => false,
        }
    }
}

/// CronJob suspend flag.
///
/// An explicitly set flag is captured, `true` included, so a job paused
/// before turndown stays paused after expand. An unset flag means "not
/// suspended", which is exactly what expand restores when no capture exists.
/// Flattening such a job twice without an expand in between captures the
/// `true` written by the first pass; expand then leaves it suspended.
pub(crate) struct JobSuspend;

impl ReversibleField<CronJob> for JobSuspend {
    type Value = bool;
    const CAPTURE_KEY: Option<&'static str> = Some(JOB_SUSPEND_CAPTURE);

    fn capture(&self, object: &CronJob) -> Flatten<bool> {
        match object.spec.as_ref() {
            None => Flatten::Skip,
            Some(spec) => Flatten::Apply(spec.suspend),
        }
    }

    fn apply(&self, object: &mut CronJob) {
        if let Some(spec) = object.spec.as_mut() {
            spec.suspend = Some(true);
        }
    }

    fn restore(&self, object: &mut CronJob, captured: Option<bool>) -> bool {
        let Some(spec) = object.spec.as_mut() else {
            return false;
        };
        let suspend = captured.unwrap_or(false);
        let changed = spec.suspend != Some(suspend);
        spec.suspend = Some(suspend);
        changed
    }
}

/// Workloads the flattener knows how to flatten and expand in place
pub(crate) trait Flattenable: Workload {
    fn flatten_in_place(&mut self, system_namespace: &str) -> bool;

    fn expand_in_place(&mut self, system_namespace: &str) -> Result<bool>;
}

fn in_namespace<K: Workload>(object: &K, namespace: &str) -> bool {
    object.namespace().as_deref() == Some(namespace)
}

impl Flattenable for Deployment {
    fn flatten_in_place(&mut self, system_namespace: &str) -> bool {
        let mut changed = false;
        if in_namespace(self, system_namespace) {
            changed |= flatten_field(&DeploymentSafeToEvict, self);
        }
        changed |= flatten_field(&Replicas, self);
        changed |= flatten_field(&RolloutMaxUnavailable, self);
        changed
    }

    fn expand_in_place(&mut self, system_namespace: &str) -> Result<bool> {
        let mut changed = false;
        if in_namespace(self, system_namespace) {
            changed |= expand_field(&DeploymentSafeToEvict, self)?;
        }
        changed |= expand_field(&Replicas, self)?;
        changed |= expand_field(&RolloutMaxUnavailable, self)?;
        Ok(changed)
    }
}

impl Flattenable for DaemonSet {
    fn flatten_in_place(&mut self, _system_namespace: &str) -> bool {
        flatten_field(&DaemonSetSafeToEvict, self)
    }

    fn expand_in_place(&mut self, _system_namespace: &str) -> Result<bool> {
        expand_field(&DaemonSetSafeToEvict, self)
    }
}

impl Flattenable for CronJob {
    fn flatten_in_place(&mut self, _system_namespace: &str) -> bool {
        flatten_field(&JobSuspend, self)
    }

    fn expand_in_place(&mut self, _system_namespace: &str) -> Result<bool> {
        expand_field(&JobSuspend, self)
    }
}
