//! Event handlers
//!
//! Each handler runs to completion and returns `Handled`: `Ok(())` when the
//! event is done with, `Err(Retry)` when it should be delivered again later.
//! Typed errors from the layers below are turned into a retry, a reported
//! status or an action failure here and nowhere else.

use std::collections::BTreeSet;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::actions::ActionOutcome;
use crate::backup::{Admission, BackupAction, BackupCoordinator, BackupState, S3Credentials};
use crate::backup::admission;
use crate::config::actions::{PASSWORD_PARAM, SECRET_ID_RESULT};
use crate::config::{FLAG_TRUE, SOCKET_PATH, UNIT_DEPARTED_KEY};
use crate::controller::bootstrap::{self, PASSWORD_LENGTH};
use crate::controller::context::Context;
use crate::controller::error::{Error, Handled, Result, Retry};
use crate::controller::membership::UnitId;
use crate::controller::reconciler::{ReconcileOutcome, Trigger, reconcile};
use crate::controller::retry::RetryPolicy;
use crate::controller::status::{UnitStatus, backup_status_needed, database_status, project};
use crate::controller::users::{self, OPERATOR};
use crate::resources::secret::{compare_secret_ids, generate_password};
use crate::resources::{DriverError, Scope};

pub const WAITING_FOR_MONGODB: &str = "Waiting for MongoDB to start";

/// How long a departing unit waits to leave the replica set
const UNIT_REMOVAL_POLICY: RetryPolicy = RetryPolicy::fixed(1000, Duration::from_secs(1));

/// Convert a handler error into its `Handled` outcome
fn settle(err: Error) -> Handled {
    match err {
        Error::NotCoordinator => {
            debug!("Not the coordinator, nothing to do");
            Ok(())
        }
        e if e.is_retryable() => {
            info!("Deferring: {}", e);
            Err(Retry::from(e))
        }
        e => {
            error!("Handler failed: {}", e);
            Ok(())
        }
    }
}

/// Whether mongod on this unit answers a direct connection
async fn local_ready(ctx: &Context) -> Result<bool> {
    let config = ctx
        .user_config(&OPERATOR, BTreeSet::from([ctx.hostname()]))
        .await?;
    Ok(ctx
        .driver
        .connect(&config, Some("localhost"), true)
        .is_ready()
        .await)
}

#[instrument(skip(ctx), fields(unit = %ctx.unit))]
pub async fn on_start(ctx: &Context) -> Handled {
    start(ctx).await.or_else(settle)
}

async fn start(ctx: &Context) -> Result<()> {
    if ctx.is_leader() {
        bootstrap::generate_secrets(ctx).await?;
    }

    if !ctx.workload.can_connect().await {
        return Err(Error::NotReady("workload container is not up".to_string()));
    }
    bootstrap::push_keyfile(ctx).await?;

    if !ctx.workload.exists(SOCKET_PATH).await? {
        return Err(Error::NotReady("mongod socket is not available".to_string()));
    }
    if !local_ready(ctx).await? {
        ctx.reporter
            .report(&UnitStatus::Waiting(WAITING_FOR_MONGODB.to_string()))
            .await;
        return Err(Error::NotReady("mongod is not ready".to_string()));
    }

    bootstrap::initialise_replica_set(ctx).await
}

/// Peer joined or changed, or this unit became the coordinator
#[instrument(skip(ctx), fields(unit = %ctx.unit, trigger = %trigger))]
pub async fn on_peer_changed(ctx: &Context, trigger: Trigger) -> Handled {
    match membership_pass(ctx, &trigger).await {
        Ok(ReconcileOutcome::Deferred { host, .. }) => {
            Err(Retry::new(format!("member {} is not ready", host)))
        }
        Ok(_) => Ok(()),
        Err(e) => settle(e),
    }
}

async fn membership_pass(ctx: &Context, trigger: &Trigger) -> Result<ReconcileOutcome> {
    if !ctx.is_leader() {
        return Err(Error::NotCoordinator);
    }
    bootstrap::generate_secrets(ctx).await?;
    if !ctx.db_initialised().await? {
        debug!("Replica set not initialised yet");
        return Ok(ReconcileOutcome::Unchanged);
    }
    reconcile(ctx, trigger).await
}

/// A peer is leaving the application
#[instrument(skip(ctx), fields(unit = %ctx.unit, departing = %unit))]
pub async fn on_peer_departed(ctx: &Context, unit: &UnitId) -> Handled {
    if *unit == ctx.unit {
        info!("This unit is departing");
        if let Err(e) = ctx.peers.set(Scope::Unit, UNIT_DEPARTED_KEY, FLAG_TRUE).await {
            return settle(e.into());
        }
    }
    on_peer_changed(
        ctx,
        Trigger::PeerDeparted {
            host: unit.hostname(),
        },
    )
    .await
}

#[instrument(skip(ctx), fields(unit = %ctx.unit))]
pub async fn on_update_status(ctx: &Context) -> Handled {
    update_status(ctx).await.or_else(settle)
}

async fn update_status(ctx: &Context) -> Result<()> {
    if !ctx.db_initialised().await? {
        return Ok(());
    }
    if !local_ready(ctx).await? {
        report(ctx, UnitStatus::Waiting(WAITING_FOR_MONGODB.to_string())).await;
        return Ok(());
    }

    if ctx.is_leader() {
        // Periodic ticks are the safety net for missed or deferred triggers
        match reconcile(ctx, &Trigger::Periodic).await {
            Ok(ReconcileOutcome::Deferred { host, .. }) => {
                debug!(host = %host, "Member addition deferred to the next tick")
            }
            Ok(_) => {}
            Err(e) => warn!("Periodic reconciliation failed: {}", e),
        }
    }

    let status = current_status(ctx).await?;
    report(ctx, status).await;
    Ok(())
}

/// Projected unit status from the database and, if needed, pbm
async fn current_status(ctx: &Context) -> Result<UnitStatus> {
    let database = member_status(ctx).await?;

    let relation = ctx.backup_relation_present().await;
    let backup = if backup_status_needed(&database, relation) {
        let coordinator = ctx.backup_coordinator().await?;
        Some(UnitStatus::from(coordinator.backup_state().await))
    } else {
        None
    };
    Ok(project(database, relation, backup))
}

/// Database status of this unit from the replica set member states
async fn member_status(ctx: &Context) -> Result<UnitStatus> {
    let config = ctx.mongodb_config().await?;
    let states = match ctx
        .driver
        .connect(&config, None, false)
        .get_member_states()
        .await
    {
        Ok(states) => Some(states),
        Err(e) => {
            debug!("Failed to read replica set status: {}", e);
            None
        }
    };
    Ok(database_status(states.as_ref(), &ctx.hostname()))
}

async fn report(ctx: &Context, status: UnitStatus) {
    if let Some(health) = &ctx.health {
        health.metrics.set_unit_status(&status);
    }
    ctx.reporter.report(&status).await;
}

/// S3 credentials appeared, changed or went away
#[instrument(skip(ctx, credentials), fields(unit = %ctx.unit, present = credentials.is_some()))]
pub async fn on_credentials_changed(ctx: &Context, credentials: Option<S3Credentials>) -> Handled {
    ctx.set_s3_credentials(credentials.clone()).await;
    let Some(credentials) = credentials else {
        info!("S3 credentials removed");
        return on_update_status(ctx).await;
    };

    match ctx.db_initialised().await {
        Ok(true) => {}
        Ok(false) => {
            return Err(Retry::new(
                "Set PBM configurations, MongoDB has not yet started.",
            ));
        }
        Err(e) => return settle(e),
    }

    let coordinator = match ctx.backup_coordinator().await {
        Ok(coordinator) => coordinator,
        Err(e) => return settle(e),
    };
    match coordinator.pbm().service_exists().await {
        Ok(true) => {}
        Ok(false) => return Err(Retry::new("pbm-agent service is not defined yet")),
        Err(e) => return Err(Retry::new(format!("pbm-agent service check failed: {}", e))),
    }

    if !ctx.is_leader() {
        debug!("Only the coordinator configures pbm");
        return on_update_status(ctx).await;
    }

    let database = match member_status(ctx).await {
        Ok(database) => database,
        Err(e) => return settle(e),
    };
    if let Some(health) = &ctx.health {
        health.metrics.record_resync();
    }
    coordinator
        .with_database_status(database)
        .configure(&credentials)
        .await
}

/// A secret changed outside this unit
#[instrument(skip(ctx), fields(unit = %ctx.unit))]
pub async fn on_secret_changed(ctx: &Context, id: &str) -> Handled {
    for scope in [Scope::App, Scope::Unit] {
        let known = match ctx.secrets.secret_id(scope).await {
            Ok(known) => known,
            Err(e) => return settle(e.into()),
        };
        if known.is_some_and(|known| compare_secret_ids(id, &known)) {
            info!(scope = %scope, "Reloading changed secret");
            return match ctx.secrets.reload(scope).await {
                Ok(()) => Ok(()),
                Err(e) => settle(e.into()),
            };
        }
    }
    debug!("Secret {} changed, but it's unknown", id);
    Ok(())
}

/// The unit is stopping
///
/// A departing unit waits until the coordinator has removed it from the
/// replica set. Stop cannot be deferred, so failures are only logged.
#[instrument(skip(ctx), fields(unit = %ctx.unit))]
pub async fn on_stop(ctx: &Context) -> Handled {
    match ctx.unit_departed().await {
        Ok(true) => {}
        Ok(false) => return Ok(()),
        Err(e) => {
            warn!("Could not read departure flag: {}", e);
            return Ok(());
        }
    }

    let hostname = ctx.hostname();
    let removed = UNIT_REMOVAL_POLICY
        .retry_all(ctx.sleeper.as_ref(), "unit removal", || {
            let hostname = &hostname;
            async move {
                let config = ctx.mongodb_config().await?;
                let members = ctx
                    .driver
                    .connect(&config, None, false)
                    .get_members()
                    .await?;
                if members.contains(hostname) {
                    return Err(Error::NotReady(format!("{} is still a member", hostname)));
                }
                Ok(())
            }
        })
        .await;

    match removed {
        Ok(()) => info!("Unit removed from the replica set"),
        Err(e) => error!("Failed to wait for removal from the replica set: {}", e),
    }
    if let Err(e) = ctx.peers.remove(Scope::Unit, UNIT_DEPARTED_KEY).await {
        warn!("Could not clear departure flag: {}", e);
    }
    Ok(())
}

fn internal_user(username: Option<&str>) -> std::result::Result<&'static str, ActionOutcome> {
    let username = username.unwrap_or(OPERATOR.username);
    users::find(username).map(|u| u.username).ok_or_else(|| {
        ActionOutcome::failed(format!(
            "The action can be run only for users used by the charm: {} not {}",
            users::usernames().join(", "),
            username
        ))
    })
}

#[instrument(skip(ctx), fields(unit = %ctx.unit))]
pub async fn get_password(ctx: &Context, username: Option<&str>) -> ActionOutcome {
    let username = match internal_user(username) {
        Ok(username) => username,
        Err(outcome) => return outcome,
    };
    match ctx.secrets.get(Scope::App, &users::password_key(username)).await {
        Ok(Some(password)) => ActionOutcome::success([(PASSWORD_PARAM, password)]),
        Ok(None) => ActionOutcome::failed(format!("Password for {} is not available yet", username)),
        Err(e) => ActionOutcome::failed(format!("Failed to read the password: {}", e)),
    }
}

#[instrument(skip(ctx, password), fields(unit = %ctx.unit))]
pub async fn set_password(
    ctx: &Context,
    username: Option<&str>,
    password: Option<&str>,
) -> ActionOutcome {
    if !ctx.is_leader() {
        return ActionOutcome::failed("Password rotation must be called on leader unit");
    }
    let username = match internal_user(username) {
        Ok(username) => username,
        Err(outcome) => return outcome,
    };
    let password = password
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| generate_password(PASSWORD_LENGTH));

    match rotate_password(ctx, username, &password).await {
        Ok(secret_id) => ActionOutcome::success([
            (PASSWORD_PARAM.to_string(), password),
            (SECRET_ID_RESULT.to_string(), secret_id),
        ]),
        Err(Error::DriverError(DriverError::NotReady(_))) => {
            ActionOutcome::failed("Failed changing the password: Not all members are ready yet.")
        }
        Err(e) => ActionOutcome::failed(format!("Failed changing the password: {}", e)),
    }
}

async fn rotate_password(ctx: &Context, username: &str, password: &str) -> Result<String> {
    let key = users::password_key(username);
    let current = ctx.secrets.get(Scope::App, &key).await?;
    if current.as_deref() == Some(password) {
        debug!(user = %username, "Password unchanged");
        return Ok(ctx.secrets.secret_id(Scope::App).await?.unwrap_or_default());
    }

    let config = ctx.mongodb_config().await?;
    ctx.driver
        .connect(&config, None, false)
        .set_user_password(username, password)
        .await?;

    let secret_id = ctx.secrets.set(Scope::App, &key, password).await?;
    info!(user = %username, "Password changed");
    Ok(secret_id.unwrap_or_default())
}

/// Run a backup action through admission control
#[instrument(skip(ctx), fields(unit = %ctx.unit, action = %action))]
pub async fn run_backup_action(ctx: &Context, action: &BackupAction) -> ActionOutcome {
    let relation = ctx.backup_relation_present().await;
    if let Some(decision) = admission::precheck(action, relation, ctx.is_leader()) {
        return decided(decision);
    }

    let coordinator = match ctx.backup_coordinator().await {
        Ok(coordinator) => coordinator,
        Err(e) => return ActionOutcome::failed(format!("Cannot reach pbm: {}", e)),
    };
    let state = coordinator.backup_state().await;
    report(ctx, state.clone().into()).await;

    match admission::admit(action, &state) {
        Admission::Proceed => execute(ctx, &coordinator, action).await,
        decision => decided(decision),
    }
}

fn decided(decision: Admission) -> ActionOutcome {
    match decision {
        Admission::Reject(message) => ActionOutcome::Failed(message),
        Admission::Defer(message) => ActionOutcome::Deferred(message),
        Admission::Proceed => ActionOutcome::Success(Default::default()),
    }
}

async fn execute(ctx: &Context, coordinator: &BackupCoordinator, action: &BackupAction) -> ActionOutcome {
    let result = match action {
        BackupAction::CreateBackup => coordinator
            .create_backup()
            .await
            .map(|status| ("backup-status", status)),
        BackupAction::ListBackups => coordinator
            .list_backups()
            .await
            .map(|backups| ("backups", backups)),
        BackupAction::Restore { backup_id } => coordinator
            .restore(backup_id.as_deref().unwrap_or_default(), ctx.config.replset())
            .await
            .map(|status| ("restore-status", status)),
    };

    match result {
        Ok((key, value)) => {
            if action.is_mutating() {
                let state: BackupState = coordinator.backup_state().await;
                report(ctx, state.into()).await;
            }
            ActionOutcome::success([(key, value)])
        }
        Err(e) => {
            error!("Failed to {}: {}", action, e);
            ActionOutcome::failed(format!("Failed to {}: {}", action, e))
        }
    }
}
