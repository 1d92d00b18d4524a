//! Unit tests for the pbm resync protocol

use std::time::Duration;

use mongodb_operator::backup::coordinator::CONFIGURATION_FAILED_MESSAGE;
use mongodb_operator::backup::pbm::{
    GENERIC_ERROR_MESSAGE, RESYNC_WAITING_MESSAGE, SERVICE_WAITING_MESSAGE,
};
use mongodb_operator::backup::{BackupError, BackupState, SyncPolicies};
use mongodb_operator::controller::RetryPolicy;
use mongodb_operator::controller::status::UnitStatus;

use crate::common::*;

const STATUS: [&str; 3] = ["status", "-o", "json"];

fn status_polls(h: &TestHarness) -> usize {
    h.workload
        .pbm_calls()
        .iter()
        .filter(|args| *args == &STATUS)
        .count()
}

fn resync_requested(h: &TestHarness) -> bool {
    h.workload
        .pbm_calls()
        .iter()
        .any(|args| *args == ["config", "--force-resync"])
}

mod pre_check_tests {
    use super::*;

    #[tokio::test]
    async fn test_busy_agent_is_restarted_twenty_times() {
        let h = TestHarness::new(&[]).await;
        h.workload
            .set_default_status(PbmReply::output(PBM_BACKUP_RUNNING));
        let coordinator = h.ctx.backup_coordinator().await.unwrap();

        let result = coordinator.resync_and_verify().await;

        assert!(matches!(result, Err(BackupError::Busy)));
        assert_eq!(h.workload.restarts(), 20);
        assert_eq!(h.sleeper.slept(), vec![Duration::from_secs(5); 19]);
        assert!(!resync_requested(&h));
    }

    #[tokio::test]
    async fn test_running_resync_also_counts_as_busy() {
        let h = TestHarness::new(&[]).await;
        h.workload.script_statuses([
            PbmReply::output(PBM_RESYNCING),
            PbmReply::output(PBM_IDLE),
        ]);
        let coordinator = h.ctx.backup_coordinator().await.unwrap();

        coordinator.resync_and_verify().await.unwrap();

        assert_eq!(h.workload.restarts(), 1);
        assert!(resync_requested(&h));
    }

    #[tokio::test]
    async fn test_agent_not_up_is_waited_for_not_restarted() {
        let h = TestHarness::new(&[]).await;
        h.workload.set_service_defined(false);
        let coordinator = h.ctx.backup_coordinator().await.unwrap();

        let result = coordinator.resync_and_verify().await;

        assert!(matches!(result, Err(BackupError::ServiceUnavailable)));
        assert_eq!(h.workload.restarts(), 0);
        assert_eq!(h.sleeper.slept(), vec![Duration::from_secs(5); 19]);
        assert!(!resync_requested(&h));
    }

    #[tokio::test]
    async fn test_agent_is_started_first() {
        let h = TestHarness::new(&[]).await;
        let coordinator = h.ctx.backup_coordinator().await.unwrap();

        coordinator.resync_and_verify().await.unwrap();

        assert_eq!(h.workload.starts(), 1);
    }
}

mod post_check_tests {
    use super::*;

    #[tokio::test]
    async fn test_resync_polled_until_done() {
        let h = TestHarness::new(&[]).await;
        h.workload.script_statuses([
            PbmReply::output(PBM_IDLE),
            PbmReply::output(PBM_RESYNCING),
            PbmReply::output(PBM_RESYNCING),
            PbmReply::output(PBM_IDLE),
        ]);
        let coordinator = h.ctx.backup_coordinator().await.unwrap();

        coordinator.resync_and_verify().await.unwrap();

        assert_eq!(status_polls(&h), 4);
        assert_eq!(
            h.sleeper.slept(),
            vec![
                Duration::from_secs(2),
                Duration::from_secs(5),
                Duration::from_secs(5)
            ]
        );
        assert!(
            h.reporter
                .reported()
                .contains(&UnitStatus::Waiting(RESYNC_WAITING_MESSAGE.to_string()))
        );
    }

    #[tokio::test]
    async fn test_endless_resync_exhausts_both_loops() {
        let h = TestHarness::new(&[]).await.with_sync_policies(SyncPolicies {
            pre_check: RetryPolicy::fixed(2, Duration::from_secs(1)),
            grace: Duration::from_secs(2),
            inner: RetryPolicy::fixed(2, Duration::from_secs(1)),
            outer: RetryPolicy::fixed(3, Duration::ZERO),
        });
        h.workload.script_statuses([PbmReply::output(PBM_IDLE)]);
        h.workload.set_default_status(PbmReply::output(PBM_RESYNCING));
        let coordinator = h.ctx.backup_coordinator().await.unwrap();

        let result = coordinator.resync_and_verify().await;

        assert!(matches!(result, Err(BackupError::Resyncing)));
        // one pre-check poll, then 3 outer x 2 inner
        assert_eq!(status_polls(&h), 7);
        assert_eq!(
            h.sleeper.slept(),
            vec![
                Duration::from_secs(2),
                Duration::from_secs(1),
                Duration::from_secs(1),
                Duration::from_secs(1)
            ]
        );
    }

    #[tokio::test]
    async fn test_tool_error_is_not_retried_by_outer_loop() {
        let h = TestHarness::new(&[]).await;
        h.workload.set_default_status(PbmReply::failed(PBM_FORBIDDEN));
        let coordinator = h.ctx.backup_coordinator().await.unwrap();

        let result = coordinator.resync_and_verify().await;

        match result {
            Err(BackupError::Tool(message)) => {
                assert_eq!(message, "s3 credentials are incorrect.")
            }
            other => panic!("expected a tool error, got {:?}", other),
        }
        // pre-check, then the inner loop's three attempts
        assert_eq!(status_polls(&h), 4);
        assert_eq!(
            h.reporter.last(),
            Some(UnitStatus::Blocked("s3 credentials are incorrect.".to_string()))
        );
    }
}

mod configure_tests {
    use super::*;

    #[tokio::test]
    async fn test_invalid_option_blocks_without_resync() {
        let h = TestHarness::new(&[]).await;
        h.workload.fail_option("storage.s3.region");
        let coordinator = h.ctx.backup_coordinator().await.unwrap();

        let handled = coordinator.configure(&s3_credentials()).await;

        assert!(handled.is_ok());
        assert_eq!(
            h.reporter.last(),
            Some(UnitStatus::Blocked(CONFIGURATION_FAILED_MESSAGE.to_string()))
        );
        assert!(!resync_requested(&h));
    }

    #[tokio::test]
    async fn test_busy_agent_defers() {
        let h = TestHarness::new(&[]).await;
        h.workload
            .set_default_status(PbmReply::output(PBM_BACKUP_RUNNING));
        let coordinator = h.ctx.backup_coordinator().await.unwrap();

        let handled = coordinator.configure(&s3_credentials()).await;

        assert!(handled.is_err());
        assert_eq!(
            h.reporter.last(),
            Some(UnitStatus::Waiting(RESYNC_WAITING_MESSAGE.to_string()))
        );
    }

    #[tokio::test]
    async fn test_success_reports_backup_state() {
        let h = TestHarness::new(&[]).await;
        let coordinator = h.ctx.backup_coordinator().await.unwrap();

        coordinator.configure(&s3_credentials()).await.unwrap();

        assert!(resync_requested(&h));
        assert_eq!(h.reporter.last(), Some(UnitStatus::active()));
    }

    #[tokio::test]
    async fn test_database_problem_outranks_backup_status() {
        let h = TestHarness::new(&[]).await;
        h.workload.fail_option("storage.s3.region");
        let syncing = UnitStatus::Waiting("Member is syncing...".to_string());
        let coordinator = h
            .ctx
            .backup_coordinator()
            .await
            .unwrap()
            .with_database_status(syncing.clone());

        coordinator.configure(&s3_credentials()).await.unwrap();

        assert_eq!(h.reporter.last(), Some(syncing));
    }

    #[tokio::test]
    async fn test_healthy_database_yields_to_backup_problem() {
        let h = TestHarness::new(&[]).await;
        h.workload.fail_option("storage.s3.region");
        let coordinator = h
            .ctx
            .backup_coordinator()
            .await
            .unwrap()
            .with_database_status(UnitStatus::Active("Replica set primary".to_string()));

        coordinator.configure(&s3_credentials()).await.unwrap();

        assert_eq!(
            h.reporter.last(),
            Some(UnitStatus::Blocked(CONFIGURATION_FAILED_MESSAGE.to_string()))
        );
    }
}

mod state_tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_agent_is_waiting() {
        let h = TestHarness::new(&[]).await;
        h.workload.set_service_defined(false);
        let coordinator = h.ctx.backup_coordinator().await.unwrap();

        let state = coordinator.backup_state().await;

        assert_eq!(state, BackupState::Waiting(SERVICE_WAITING_MESSAGE.to_string()));
        assert_eq!(status_polls(&h), 0);
    }

    #[tokio::test]
    async fn test_garbled_status_is_generic_error() {
        let h = TestHarness::new(&[]).await;
        h.workload.set_default_status(PbmReply::output("not json"));
        let coordinator = h.ctx.backup_coordinator().await.unwrap();

        let state = coordinator.backup_state().await;

        assert_eq!(state, BackupState::Blocked(GENERIC_ERROR_MESSAGE.to_string()));
    }

    #[tokio::test]
    async fn test_failed_status_uses_stdout() {
        let h = TestHarness::new(&[]).await;
        h.workload
            .set_default_status(PbmReply::failed("status code: 404"));
        let coordinator = h.ctx.backup_coordinator().await.unwrap();

        let state = coordinator.backup_state().await;

        assert_eq!(
            state,
            BackupState::Blocked("s3 configurations are incompatible.".to_string())
        );
    }
}

mod restore_tests {
    use super::*;

    #[tokio::test]
    async fn test_restore_remaps_foreign_replica_set() {
        let h = TestHarness::new(&[]).await;
        h.workload.set_default_status(PbmReply::output(
            r#"{"backups": {"snapshot": [{
                "name": "2024-05-01T10:00:00Z",
                "status": "error",
                "error": "Backup doesn't match current cluster topology - it has different replica set names. The extra/unknown replica set names found in the backup are: rs1."
            }]}}"#,
        ));
        let coordinator = h.ctx.backup_coordinator().await.unwrap();

        coordinator
            .restore("2024-05-01T10:00:00Z", "mongodb")
            .await
            .unwrap();

        assert_eq!(
            h.workload.pbm_calls().last().unwrap(),
            &[
                "restore",
                "2024-05-01T10:00:00Z",
                "--replset-remapping",
                "mongodb=rs1"
            ]
        );
    }

    #[tokio::test]
    async fn test_restore_without_mismatch() {
        let h = TestHarness::new(&[]).await;
        let coordinator = h.ctx.backup_coordinator().await.unwrap();

        coordinator.restore("b1", "mongodb").await.unwrap();

        assert_eq!(h.workload.pbm_calls().last().unwrap(), &["restore", "b1"]);
    }
}
