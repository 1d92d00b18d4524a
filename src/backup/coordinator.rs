//! Backup sync coordinator
//!
//! pbm-agent runs one administrative operation at a time and reports its
//! progress only through `pbm status`. Every configuration change is followed
//! by a forced resync, which must not be requested while another operation
//! is running and must be polled until it finishes:
//!
//! 1. pre-check: wait for pbm to go idle, restarting the agent when it is
//!    busy (bounded, 20 x 5s)
//! 2. `pbm config --force-resync`, then a short grace period
//! 3. post-check: poll until the resync is done; quick configuration errors
//!    are absorbed by an inner loop (3 x 5s) and the long resync itself by
//!    an outer loop (20 attempts)

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::backup::BackupError;
use crate::backup::configurator::{BackupConfigurator, S3Credentials};
use crate::backup::pbm::{
    self, BackupState, GENERIC_ERROR_MESSAGE, PbmCli, PbmStatus, RESYNC_WAITING_MESSAGE,
    SERVICE_WAITING_MESSAGE,
};
use crate::controller::error::{Handled, Retry};
use crate::controller::retry::{RetryPolicy, Sleeper};
use crate::controller::status::{UnitStatus, project};
use crate::resources::status_reporter::StatusReporter;
use crate::resources::workload::WorkloadError;

pub const CONFIGURATION_FAILED_MESSAGE: &str = "couldn't configure s3 backup options.";
pub const SERVICE_START_FAILED_MESSAGE: &str = "couldn't start pbm";

/// Retry budgets of the resync protocol
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SyncPolicies {
    /// Waiting for pbm to go idle before a resync
    pub pre_check: RetryPolicy,
    /// Delay between requesting a resync and the first status poll
    pub grace: Duration,
    /// Absorbs configuration errors pbm-agent resolves by itself
    pub inner: RetryPolicy,
    /// Absorbs the resync itself; retried only while still resyncing
    pub outer: RetryPolicy,
}

impl Default for SyncPolicies {
    fn default() -> Self {
        Self {
            pre_check: RetryPolicy::fixed(20, Duration::from_secs(5)),
            grace: Duration::from_secs(2),
            inner: RetryPolicy::fixed(3, Duration::from_secs(5)),
            outer: RetryPolicy::fixed(20, Duration::ZERO),
        }
    }
}

pub struct BackupCoordinator {
    pbm: PbmCli,
    sleeper: Arc<dyn Sleeper>,
    reporter: Arc<dyn StatusReporter>,
    policies: SyncPolicies,
    /// Database status the reported backup status is projected onto
    database: UnitStatus,
}

impl BackupCoordinator {
    pub fn new(pbm: PbmCli, sleeper: Arc<dyn Sleeper>, reporter: Arc<dyn StatusReporter>) -> Self {
        Self {
            pbm,
            sleeper,
            reporter,
            policies: SyncPolicies::default(),
            database: UnitStatus::active(),
        }
    }

    pub fn with_database_status(mut self, database: UnitStatus) -> Self {
        self.database = database;
        self
    }

    pub fn with_policies(mut self, policies: SyncPolicies) -> Self {
        self.policies = policies;
        self
    }

    pub fn pbm(&self) -> &PbmCli {
        &self.pbm
    }

    /// Poll and classify the current pbm state
    ///
    /// Never fails: a missing agent is a waiting state and any unexpected
    /// failure becomes a generic blocked state.
    pub async fn backup_state(&self) -> BackupState {
        match self.pbm.service_exists().await {
            Ok(true) => {}
            Ok(false) => return BackupState::Waiting(SERVICE_WAITING_MESSAGE.to_string()),
            Err(e) => {
                error!("Failed to query the pbm-agent service: {}", e);
                return BackupState::Blocked(GENERIC_ERROR_MESSAGE.to_string());
            }
        }

        match self.pbm.status().await {
            Ok(output) => pbm::classify_output(&output),
            // pbm exits nonzero but prints the real error on stdout
            Err(WorkloadError::Exec { stdout, .. }) => {
                error!("Failed to get pbm status.");
                BackupState::Blocked(pbm::process_pbm_error(&stdout))
            }
            Err(e) => {
                error!("Failed to get pbm status: {}", e);
                BackupState::Blocked(GENERIC_ERROR_MESSAGE.to_string())
            }
        }
    }

    /// Apply credentials and resync, reporting the resulting status
    ///
    /// Busy and resyncing conditions defer; configuration and tool errors
    /// block until the credentials change again.
    pub async fn configure(&self, credentials: &S3Credentials) -> Handled {
        match self.apply_and_resync(credentials).await {
            Ok(()) => {
                let state = self.backup_state().await;
                self.report(state.into()).await;
                Ok(())
            }
            Err(BackupError::Configuration { key }) => {
                warn!(key = %key, "Invalid pbm option");
                self.report_blocked(CONFIGURATION_FAILED_MESSAGE).await;
                Ok(())
            }
            Err(e @ (BackupError::Busy | BackupError::Resyncing)) => {
                info!("Deferring: {}", e);
                self.report(UnitStatus::Waiting(RESYNC_WAITING_MESSAGE.to_string()))
                    .await;
                Err(Retry::new(e.to_string()))
            }
            Err(BackupError::Tool(message)) => {
                self.report_blocked(&message).await;
                Ok(())
            }
            Err(e @ (BackupError::ServiceUnavailable | BackupError::Workload(_))) => {
                info!("Deferring pbm configuration: {}", e);
                Err(Retry::new(e.to_string()))
            }
        }
    }

    async fn apply_and_resync(&self, credentials: &S3Credentials) -> Result<(), BackupError> {
        BackupConfigurator::new(&self.pbm).apply(credentials).await?;
        self.resync_and_verify().await
    }

    async fn report_blocked(&self, message: &str) {
        self.report(UnitStatus::Blocked(message.to_string())).await;
    }

    /// Report a backup status, unless the database status takes precedence
    async fn report(&self, backup: UnitStatus) {
        let status = project(self.database.clone(), true, Some(backup));
        self.reporter.report(&status).await;
    }

    /// Resync pbm with its storage and wait for it to finish
    pub async fn resync_and_verify(&self) -> Result<(), BackupError> {
        if let Err(e) = self.pbm.start_service().await {
            error!("An exception occurred when starting pbm agent, error: {}", e);
            return Err(BackupError::Tool(SERVICE_START_FAILED_MESSAGE.to_string()));
        }

        self.wait_until_idle().await?;

        self.pbm
            .run(&["config", "--force-resync"])
            .await
            .map_err(tool_error)?;
        self.sleeper.sleep(self.policies.grace).await;

        self.wait_until_synced().await
    }

    /// Pre-check: fail with `Busy` until pbm accepts a resync
    ///
    /// A running operation and a running resync both restart the agent. An
    /// agent that is not up yet is given the next attempt to come up instead.
    async fn wait_until_idle(&self) -> Result<(), BackupError> {
        self.policies
            .pre_check
            .retry_all(self.sleeper.as_ref(), "pbm pre-check", || async move {
                match self.backup_state().await {
                    BackupState::Waiting(message) if message == SERVICE_WAITING_MESSAGE => {
                        debug!("pbm-agent is not up yet");
                        Err(BackupError::ServiceUnavailable)
                    }
                    state @ (BackupState::Maintenance(_) | BackupState::Waiting(_)) => {
                        debug!("pbm is busy ({}), restarting pbm-agent", state);
                        self.pbm.restart_service().await?;
                        Err(BackupError::Busy)
                    }
                    _ => Ok(()),
                }
            })
            .await
    }

    async fn wait_until_synced(&self) -> Result<(), BackupError> {
        self.policies
            .outer
            .retry(
                self.sleeper.as_ref(),
                "pbm resync",
                || async move {
                    self.policies
                        .inner
                        .retry_all(self.sleeper.as_ref(), "pbm sync status", || async move {
                            self.poll_sync().await
                        })
                        .await
                },
                |e| matches!(e, BackupError::Resyncing),
            )
            .await
    }

    async fn poll_sync(&self) -> Result<(), BackupError> {
        match self.pbm.status().await {
            Ok(output) => {
                let status = PbmStatus::parse(&output)
                    .map_err(|_| BackupError::Tool(GENERIC_ERROR_MESSAGE.to_string()))?;
                if status.is_resyncing() {
                    // Resync takes minutes; let the user know right away
                    self.report(UnitStatus::Waiting(RESYNC_WAITING_MESSAGE.to_string()))
                        .await;
                    return Err(BackupError::Resyncing);
                }
                Ok(())
            }
            Err(WorkloadError::Exec { stdout, .. }) => {
                let message = pbm::process_pbm_error(&stdout);
                self.report_blocked(&message).await;
                Err(BackupError::Tool(message))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Start a backup; the caller has admitted the action
    pub async fn create_backup(&self) -> Result<String, BackupError> {
        self.pbm.run(&["backup"]).await.map_err(tool_error)?;
        Ok("backup started".to_string())
    }

    /// Backup list rendered as a table
    pub async fn list_backups(&self) -> Result<String, BackupError> {
        let output = self.pbm.status().await.map_err(tool_error)?;
        let status = PbmStatus::parse(&output)
            .map_err(|_| BackupError::Tool(GENERIC_ERROR_MESSAGE.to_string()))?;
        Ok(pbm::format_backup_list(&status))
    }

    /// Restore `backup_id` into the replica set `replset`
    pub async fn restore(&self, backup_id: &str, replset: &str) -> Result<String, BackupError> {
        let output = self.pbm.status().await.map_err(tool_error)?;
        let remapping = PbmStatus::parse(&output)
            .ok()
            .and_then(|status| pbm::replset_remapping(&status, backup_id, replset));

        let mut args = vec!["restore", backup_id];
        if let Some(remapping) = remapping.as_deref() {
            info!("Restoring {} with replica set remapping {}", backup_id, remapping);
            args.extend(["--replset-remapping", remapping]);
        }
        self.pbm.run(&args).await.map_err(tool_error)?;
        Ok("restore started".to_string())
    }
}

/// pbm reports failures on stdout; anything else is a workload problem
fn tool_error(err: WorkloadError) -> BackupError {
    match err {
        WorkloadError::Exec { stdout, .. } => BackupError::Tool(pbm::process_pbm_error(&stdout)),
        other => BackupError::Workload(other),
    }
}
