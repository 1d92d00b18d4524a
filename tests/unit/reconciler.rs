//! Unit tests for replica set reconciliation

use mongodb_operator::controller::{Error, ReconcileOutcome, Trigger, reconcile};
use mongodb_operator::resources::Scope;

use crate::common::*;

mod ordering_tests {
    use super::*;

    #[tokio::test]
    async fn test_removals_run_before_additions() {
        // live {0, 1}, desired {0, 2}
        let h = TestHarness::new(&[2]).await;
        h.set_leader(true);
        h.driver.set_live(hosts(&[0, 1]));
        h.driver.set_ready([host(0), host(2)]);

        let outcome = reconcile(&h.ctx, &Trigger::PeerChanged).await.unwrap();

        assert_eq!(
            h.driver.calls(),
            vec![format!("remove:{}", host(1)), format!("add:{}", host(2))]
        );
        assert_eq!(
            outcome,
            ReconcileOutcome::Converged {
                added: vec![host(2)],
                removed: vec![host(1)],
            }
        );
        assert_eq!(h.driver.live(), hosts(&[0, 2]));
    }

    #[tokio::test]
    async fn test_second_pass_makes_no_changes() {
        let h = TestHarness::new(&[1, 2]).await;
        h.set_leader(true);
        h.driver.set_ready([host(1), host(2)]);

        reconcile(&h.ctx, &Trigger::PeerChanged).await.unwrap();
        let calls = h.driver.calls();
        assert_eq!(calls.len(), 2);

        let outcome = reconcile(&h.ctx, &Trigger::Periodic).await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        assert_eq!(h.driver.calls(), calls);
    }

    #[tokio::test]
    async fn test_matching_sets_publish_nothing() {
        let h = TestHarness::new(&[]).await;
        h.set_leader(true);

        let outcome = reconcile(&h.ctx, &Trigger::LeaderElected).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        assert!(h.driver.calls().is_empty());
        assert!(h.publisher.published().is_empty());
    }
}

mod departure_tests {
    use super::*;

    #[tokio::test]
    async fn test_departing_host_is_not_added() {
        // The inventory still lists unit 1 while it is going away
        let h = TestHarness::new(&[1]).await;
        h.set_leader(true);
        h.driver.set_ready([host(1)]);

        let outcome = reconcile(&h.ctx, &Trigger::PeerDeparted { host: host(1) })
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        assert!(h.driver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_departed_host_is_removed() {
        let h = TestHarness::new(&[]).await;
        h.set_leader(true);
        h.driver.set_live(hosts(&[0, 1]));

        let outcome = reconcile(&h.ctx, &Trigger::PeerDeparted { host: host(1) })
            .await
            .unwrap();

        assert_eq!(h.driver.calls(), vec![format!("remove:{}", host(1))]);
        assert!(matches!(outcome, ReconcileOutcome::Converged { .. }));
    }

    #[tokio::test]
    async fn test_restarting_pod_below_replicas_stays_member() {
        // mongodb-2 is terminating for a rolling restart; replicas is still 3
        let h = TestHarness::new(&[]).await;
        h.set_leader(true);
        h.inventory.set_replicas(3);
        h.driver.set_live(hosts(&[0, 1, 2]));

        let outcome = reconcile(&h.ctx, &Trigger::PeerChanged).await.unwrap();

        assert_eq!(outcome, ReconcileOutcome::Unchanged);
        assert!(h.driver.calls().is_empty());
        assert_eq!(h.driver.live(), hosts(&[0, 1, 2]));
    }

    #[tokio::test]
    async fn test_scale_down_removes_member() {
        let h = TestHarness::new(&[]).await;
        h.set_leader(true);
        h.inventory.set_replicas(2);
        h.driver.set_live(hosts(&[0, 1, 2]));

        reconcile(&h.ctx, &Trigger::PeerDeparted { host: host(2) })
            .await
            .unwrap();

        assert_eq!(h.driver.calls(), vec![format!("remove:{}", host(2))]);
        assert_eq!(h.driver.live(), hosts(&[0, 1]));
    }
}

mod readiness_tests {
    use super::*;

    #[tokio::test]
    async fn test_unready_host_defers_addition() {
        let h = TestHarness::new(&[1]).await;
        h.set_leader(true);

        let outcome = reconcile(&h.ctx, &Trigger::PeerChanged).await.unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Deferred {
                added: vec![],
                removed: vec![],
                host: host(1),
            }
        );
        assert!(h.driver.calls().is_empty());
        assert_eq!(h.driver.live(), hosts(&[0]));
    }

    #[tokio::test]
    async fn test_removals_apply_even_when_addition_defers() {
        let h = TestHarness::new(&[2]).await;
        h.set_leader(true);
        h.driver.set_live(hosts(&[0, 1]));

        let outcome = reconcile(&h.ctx, &Trigger::PeerChanged).await.unwrap();

        assert_eq!(h.driver.calls(), vec![format!("remove:{}", host(1))]);
        let ReconcileOutcome::Deferred { host: deferred, .. } = &outcome else {
            panic!("expected a deferred outcome, got {:?}", outcome);
        };
        assert_eq!(*deferred, host(2));
    }

    #[tokio::test]
    async fn test_deferred_addition_completes_once_ready() {
        let h = TestHarness::new(&[1]).await;
        h.set_leader(true);

        reconcile(&h.ctx, &Trigger::PeerChanged).await.unwrap();
        h.driver.set_ready([host(1)]);
        let outcome = reconcile(&h.ctx, &Trigger::PeerChanged).await.unwrap();

        assert_eq!(h.driver.calls(), vec![format!("add:{}", host(1))]);
        assert!(matches!(outcome, ReconcileOutcome::Converged { .. }));
    }
}

mod guard_tests {
    use super::*;

    #[tokio::test]
    async fn test_non_coordinator_is_refused() {
        let h = TestHarness::new(&[1]).await;
        h.driver.set_ready([host(1)]);

        let result = reconcile(&h.ctx, &Trigger::PeerChanged).await;

        assert!(matches!(result, Err(Error::NotCoordinator)));
        assert!(h.driver.calls().is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_cluster() {
        let h = TestHarness::new(&[1]).await;
        h.set_leader(true);
        h.driver.set_unreachable(true);

        let result = reconcile(&h.ctx, &Trigger::PeerChanged).await;

        let err = result.unwrap_err();
        assert!(matches!(err, Error::ClusterUnreachable(_)));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_missing_operator_password() {
        let h = TestHarness::new(&[1]).await;
        h.set_leader(true);
        h.ctx.secrets.set(Scope::App, "operator-password", "").await.unwrap();

        let result = reconcile(&h.ctx, &Trigger::PeerChanged).await;

        assert!(matches!(result, Err(Error::MissingSecret(_))));
    }
}

mod publishing_tests {
    use super::*;

    #[tokio::test]
    async fn test_hosts_published_after_change() {
        let h = TestHarness::new(&[1]).await;
        h.set_leader(true);
        h.driver.set_ready([host(1)]);
        h.driver.add_user("relation-5");

        reconcile(&h.ctx, &Trigger::PeerChanged).await.unwrap();

        let published = h.publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].hosts, hosts(&[0, 1]));
        assert!(published[0].users.contains("relation-5"));
    }
}
