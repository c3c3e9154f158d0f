//! Scale-down and scale-up scenarios against in-memory collaborators

use super::*;
use crate::health::ComponentStatus;
use crate::strategy::StandardStrategy;
use crate::testing::{
    cron_job, deployment, node, pool, FakeCluster, FakeDrainer, FakeProvider, FAKE_POOL_LABEL,
};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::CronJob;

const ANCHOR: &str = "anchor";

struct Harness {
    cluster: FakeCluster,
    provider: FakeProvider,
    drainer: FakeDrainer,
    manager: TurndownManager,
}

impl Harness {
    /// `nodes` are (name, pool) pairs; the anchor node must be listed
    fn new(pools: Vec<NodePool>, nodes: &[(&str, &str)]) -> Self {
        let cluster = FakeCluster::new();
        for (name, pool_name) in nodes {
            cluster.add_node(node(name, &[(FAKE_POOL_LABEL, pool_name)]));
        }
        let provider = FakeProvider::new(pools);
        let drainer = FakeDrainer::new();
        let manager = manager_for(&cluster, &provider, &drainer);
        Self {
            cluster,
            provider,
            drainer,
            manager,
        }
    }
}

fn manager_for(cluster: &FakeCluster, provider: &FakeProvider, drainer: &FakeDrainer) -> TurndownManager {
    let settings = TurndownSettings::default();
    let client: Arc<dyn ClusterClient> = Arc::new(cluster.clone());
    TurndownManager::new(
        client.clone(),
        Arc::new(provider.clone()),
        Arc::new(StandardStrategy::from_settings(client, ANCHOR, &settings)),
        Arc::new(drainer.clone()),
        ANCHOR,
        &settings,
    )
}

fn replicas(d: Option<Deployment>) -> Option<i32> {
    d.and_then(|d| d.spec).and_then(|s| s.replicas)
}

fn suspend(job: Option<CronJob>) -> Option<bool> {
    job.and_then(|j| j.spec).and_then(|s| s.suspend)
}

/// Anchor in an autoscaling pool next to a fixed pool of three
fn autoscaling_cluster() -> Harness {
    Harness::new(
        vec![pool("auto", true, 2), pool("fixed", false, 3)],
        &[
            (ANCHOR, "auto"),
            ("auto-1", "auto"),
            ("fixed-1", "fixed"),
            ("fixed-2", "fixed"),
            ("fixed-3", "fixed"),
        ],
    )
}

/// Two fixed pools, the anchor in the first
fn fixed_cluster() -> Harness {
    Harness::new(
        vec![pool("primary", false, 2), pool("secondary", false, 2)],
        &[
            (ANCHOR, "primary"),
            ("primary-1", "primary"),
            ("secondary-1", "secondary"),
            ("secondary-2", "secondary"),
        ],
    )
}

mod scale_down_tests {
    use super::*;

    #[tokio::test]
    async fn test_autoscaling_cluster_round_trip() {
        let mut h = autoscaling_cluster();
        h.cluster.add_deployment(deployment("shop", "web", Some(4)));

        h.manager.scale_down_cluster().await.unwrap();

        assert!(h.manager.is_scaled_down());
        assert_eq!(h.provider.resizes(), vec![(vec!["fixed".to_string()], 0)]);
        assert_eq!(h.provider.size_of("fixed"), Some(0));
        assert_eq!(h.provider.size_of("auto"), Some(2));
        assert_eq!(h.drainer.drained(), vec!["fixed-1", "fixed-2", "fixed-3"]);
        assert_eq!(replicas(h.cluster.deployment("shop", "web")), Some(0));

        let record = h.manager.record().unwrap();
        assert!(record.was_auto_scaling);
        assert_eq!(record.pool_names(), vec!["fixed"]);

        h.manager.scale_up_cluster().await.unwrap();

        assert_eq!(h.provider.resets(), vec![vec!["fixed".to_string()]]);
        assert_eq!(h.provider.size_of("fixed"), Some(3));
        assert_eq!(replicas(h.cluster.deployment("shop", "web")), Some(4));
        assert!(h.manager.record().is_none());
        assert!(!h.manager.is_scaled_down());
    }

    #[tokio::test]
    async fn test_fixed_cluster_only_suspends_jobs() {
        let mut h = fixed_cluster();
        h.cluster.add_deployment(deployment("shop", "web", Some(3)));
        h.cluster.add_cron_job(cron_job("batch", "report", None));

        h.manager.scale_down_cluster().await.unwrap();

        assert_eq!(replicas(h.cluster.deployment("shop", "web")), Some(3));
        assert_eq!(suspend(h.cluster.cron_job("batch", "report")), Some(true));
        assert_eq!(
            h.provider.resizes(),
            vec![(vec!["secondary".to_string()], 0)]
        );
        assert_eq!(
            h.drainer.drained(),
            vec!["primary-1", "secondary-1", "secondary-2"]
        );
        assert!(!h.manager.record().unwrap().was_auto_scaling);

        h.manager.scale_up_cluster().await.unwrap();

        assert_eq!(h.provider.resets(), vec![vec!["secondary".to_string()]]);
        assert_eq!(suspend(h.cluster.cron_job("batch", "report")), Some(false));
    }

    #[tokio::test]
    async fn test_second_scale_down_skips_resize() {
        let mut h = autoscaling_cluster();

        h.manager.scale_down_cluster().await.unwrap();
        assert!(h.manager.is_scaled_down());

        h.manager.scale_down_cluster().await.unwrap();

        assert_eq!(h.provider.resizes().len(), 1);
        assert!(h.manager.is_scaled_down());
        // The recorded size is the one from before the first resize
        assert_eq!(h.manager.record().unwrap().target_pools[0].node_count, 3);
    }

    #[tokio::test]
    async fn test_autoscaling_only_cluster_counts_as_scaled_down() {
        let mut h = Harness::new(
            vec![pool("auto", true, 2)],
            &[(ANCHOR, "auto"), ("auto-1", "auto")],
        );
        h.cluster.add_deployment(deployment("shop", "web", Some(2)));

        h.manager.scale_down_cluster().await.unwrap();

        assert!(h.provider.resizes().is_empty());
        assert!(h.drainer.drained().is_empty());
        assert!(h.manager.is_scaled_down());

        h.manager.scale_up_cluster().await.unwrap();

        assert!(h.provider.resets().is_empty());
        assert_eq!(replicas(h.cluster.deployment("shop", "web")), Some(2));
        assert!(!h.manager.is_scaled_down());
    }

    #[tokio::test]
    async fn test_node_in_unknown_pool_not_drained() {
        let mut h = Harness::new(
            vec![pool("primary", false, 1)],
            &[(ANCHOR, "primary"), ("stray", "ghost")],
        );

        h.manager.scale_down_cluster().await.unwrap();

        assert!(h.drainer.drained().is_empty());
        // Only the anchor's pool exists, so nothing is resized
        assert!(h.provider.resizes().is_empty());
        assert!(!h.manager.is_scaled_down());
    }

    #[tokio::test]
    async fn test_drain_failure_does_not_stop_scale_down() {
        let mut h = autoscaling_cluster();
        h.drainer.fail_on("fixed-2");

        h.manager.scale_down_cluster().await.unwrap();

        assert_eq!(h.drainer.drained(), vec!["fixed-1", "fixed-2", "fixed-3"]);
        assert_eq!(h.provider.resizes().len(), 1);
    }

    #[tokio::test]
    async fn test_resize_failure_keeps_record() {
        let mut h = autoscaling_cluster();
        h.provider.fail_resize(true);

        let err = h.manager.scale_down_cluster().await.unwrap_err();
        assert!(matches!(err, TurndownError::Provider(_)));
        assert!(h.manager.is_scaled_down());
        // Drains are not rolled back
        assert_eq!(h.drainer.drained().len(), 3);

        let record = h.manager.record().unwrap();
        assert!(record.target_pools.is_empty());
        assert_eq!(record.pending_pools, vec![pool("fixed", false, 3)]);

        h.manager.scale_up_cluster().await.unwrap();
        assert_eq!(h.provider.resets(), vec![vec!["fixed".to_string()]]);
    }

    #[tokio::test]
    async fn test_failed_resize_retried_on_next_scale_down() {
        let mut h = autoscaling_cluster();
        h.provider.fail_resize(true);
        assert!(h.manager.scale_down_cluster().await.is_err());
        assert_eq!(h.provider.size_of("fixed"), Some(3));

        h.provider.fail_resize(false);
        h.manager.scale_down_cluster().await.unwrap();

        assert_eq!(h.provider.resizes().len(), 2);
        assert_eq!(h.provider.size_of("fixed"), Some(0));
        let record = h.manager.record().unwrap();
        assert!(record.pending_pools.is_empty());
        assert_eq!(record.target_pools, vec![pool("fixed", false, 3)]);

        h.manager.scale_up_cluster().await.unwrap();
        assert_eq!(h.provider.size_of("fixed"), Some(3));
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_before_drain() {
        let mut h = fixed_cluster();
        h.cluster.fail_listing(crate::models::WorkloadKind::CronJob);

        assert!(h.manager.scale_down_cluster().await.is_err());
        assert!(h.drainer.drained().is_empty());
        assert!(h.provider.resizes().is_empty());
        assert!(h.manager.record().is_none());
    }
}

mod scale_up_tests {
    use super::*;

    #[tokio::test]
    async fn test_nothing_to_restore() {
        let mut h = Harness::new(vec![], &[(ANCHOR, "default")]);

        let err = h.manager.scale_up_cluster().await.unwrap_err();
        assert!(matches!(err, TurndownError::NothingToRestore));
    }

    #[tokio::test]
    async fn test_record_rebuilt_from_provider() {
        let mut h = fixed_cluster();

        h.manager.scale_up_cluster().await.unwrap();

        assert_eq!(
            h.provider.resets(),
            vec![vec!["primary".to_string(), "secondary".to_string()]]
        );
        assert_eq!(h.provider.size_of("primary"), Some(2));
        assert_eq!(h.provider.size_of("secondary"), Some(2));
        assert!(h.manager.record().is_none());
    }

    #[tokio::test]
    async fn test_rebuilt_record_restores_pre_turndown_sizes() {
        let mut h = fixed_cluster();
        h.cluster.add_cron_job(cron_job("batch", "report", None));
        h.manager.scale_down_cluster().await.unwrap();
        assert_eq!(h.provider.size_of("secondary"), Some(0));

        // A restarted process holds no record
        let mut restarted = manager_for(&h.cluster, &h.provider, &h.drainer);
        restarted.scale_up_cluster().await.unwrap();

        assert_eq!(h.provider.size_of("secondary"), Some(2));
        assert_eq!(h.provider.size_of("primary"), Some(2));
        assert_eq!(suspend(h.cluster.cron_job("batch", "report")), Some(false));
    }

    #[tokio::test]
    async fn test_rebuild_rejects_empty_pool_of_unknown_size() {
        let mut h = Harness::new(
            vec![pool("primary", false, 2), pool("batch", false, 0)],
            &[(ANCHOR, "primary")],
        );

        let err = h.manager.scale_up_cluster().await.unwrap_err();

        match err {
            TurndownError::UnknownPoolSize(pools) => assert_eq!(pools, vec!["batch"]),
            other => panic!("unexpected error: {}", other),
        }
        assert!(h.provider.resets().is_empty());
    }

    #[tokio::test]
    async fn test_reset_failure_keeps_record() {
        let mut h = autoscaling_cluster();
        h.manager.scale_down_cluster().await.unwrap();
        h.provider.fail_reset(true);

        assert!(h.manager.scale_up_cluster().await.is_err());
        assert!(h.manager.is_scaled_down());
        assert_eq!(h.manager.record().unwrap().pool_names(), vec!["fixed"]);

        h.provider.fail_reset(false);
        h.manager.scale_up_cluster().await.unwrap();
        assert!(!h.manager.is_scaled_down());
    }

    #[tokio::test]
    async fn test_persisted_record_survives_restart() {
        let mut h = autoscaling_cluster();
        h.cluster.add_deployment(deployment("shop", "web", Some(6)));
        h.manager.scale_down_cluster().await.unwrap();

        let saved = serde_json::to_string(h.manager.record().unwrap()).unwrap();

        let mut restarted = manager_for(&h.cluster, &h.provider, &h.drainer);
        assert!(!restarted.is_scaled_down());
        restarted.restore_record(serde_json::from_str(&saved).unwrap());
        assert!(restarted.is_scaled_down());

        restarted.scale_up_cluster().await.unwrap();

        assert_eq!(h.provider.size_of("fixed"), Some(3));
        assert_eq!(replicas(h.cluster.deployment("shop", "web")), Some(6));
    }
}

mod health_tests {
    use super::*;

    async fn status_of(registry: &HealthRegistry, component: &str) -> Option<ComponentStatus> {
        registry
            .health()
            .await
            .components
            .get(component)
            .map(|h| h.status)
    }

    fn with_health(h: &mut Harness) -> HealthRegistry {
        let registry = HealthRegistry::new();
        h.manager = manager_for(&h.cluster, &h.provider, &h.drainer).with_health(registry.clone());
        registry
    }

    #[tokio::test]
    async fn test_resize_failure_degrades_provider() {
        let mut h = autoscaling_cluster();
        let registry = with_health(&mut h);
        h.provider.fail_resize(true);

        assert!(h.manager.scale_down_cluster().await.is_err());
        assert_eq!(
            status_of(&registry, components::PROVIDER).await,
            Some(ComponentStatus::Degraded)
        );
        assert_eq!(status_of(&registry, components::KUBERNETES).await, None);

        h.provider.fail_resize(false);
        h.manager.scale_down_cluster().await.unwrap();
        assert_eq!(
            status_of(&registry, components::PROVIDER).await,
            Some(ComponentStatus::Healthy)
        );
    }

    #[tokio::test]
    async fn test_listing_failure_degrades_kubernetes() {
        let mut h = fixed_cluster();
        let registry = with_health(&mut h);
        h.cluster.fail_listing(crate::models::WorkloadKind::CronJob);

        assert!(h.manager.scale_down_cluster().await.is_err());

        assert_eq!(
            status_of(&registry, components::KUBERNETES).await,
            Some(ComponentStatus::Degraded)
        );
        assert_eq!(status_of(&registry, components::PROVIDER).await, None);
    }

    #[tokio::test]
    async fn test_failed_prepare_marks_environment_unhealthy() {
        let mut h = autoscaling_cluster();
        let registry = with_health(&mut h);

        assert!(h.manager.prepare_turndown_environment().await.is_err());

        assert_eq!(
            status_of(&registry, components::ENVIRONMENT).await,
            Some(ComponentStatus::Unhealthy)
        );
        assert_eq!(status_of(&registry, components::PROVIDER).await, None);
    }
}

mod environment_tests {
    use super::*;
    use crate::strategy::KUBE_DNS;

    fn with_own_deployment(h: &Harness) {
        h.cluster
            .add_deployment(deployment("kube-system", KUBE_DNS, Some(2)));
        h.cluster
            .add_deployment(deployment("turndown", "cluster-turndown", Some(1)));
    }

    #[tokio::test]
    async fn test_prepare_pins_own_deployment() {
        let h = autoscaling_cluster();
        with_own_deployment(&h);

        assert!(!h.manager.is_running_on_turndown_node().await.unwrap());

        h.manager.prepare_turndown_environment().await.unwrap();

        assert!(h.manager.is_running_on_turndown_node().await.unwrap());

        let own = h.cluster.deployment("turndown", "cluster-turndown").unwrap();
        let pod_spec = own.spec.unwrap().template.spec.unwrap();
        let selector = pod_spec.node_selector.unwrap();
        assert_eq!(selector.len(), 1);
        assert_eq!(selector.get(TURNDOWN_NODE_LABEL).map(String::as_str), Some("true"));
        let tolerations = pod_spec.tolerations.unwrap();
        assert_eq!(tolerations.len(), 1);
        assert_eq!(tolerations[0].key.as_deref(), Some("cluster-turndown"));
        assert_eq!(tolerations[0].effect.as_deref(), Some("NoSchedule"));
        assert_eq!(tolerations[0].operator.as_deref(), Some("Exists"));

        assert_eq!(h.cluster.patches_for(KUBE_DNS), 1);
    }

    #[tokio::test]
    async fn test_prepare_is_idempotent() {
        let h = autoscaling_cluster();
        with_own_deployment(&h);

        h.manager.prepare_turndown_environment().await.unwrap();
        let patches = h.cluster.patch_count();

        h.manager.prepare_turndown_environment().await.unwrap();

        assert_eq!(h.cluster.patch_count(), patches);
    }

    #[tokio::test]
    async fn test_prepare_fails_without_own_deployment() {
        let h = autoscaling_cluster();
        h.cluster
            .add_deployment(deployment("kube-system", KUBE_DNS, Some(2)));

        let err = h.manager.prepare_turndown_environment().await.unwrap_err();
        assert!(matches!(err, TurndownError::NotFound { .. }));
    }
}
