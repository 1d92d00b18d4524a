//! Replica set reconciliation
//!
//! Converges the live replica set configuration with the members derived
//! from the peer inventory. Each pass re-reads the live set; nothing is
//! carried over between passes, so a pass triggered by an old event is as
//! safe as one triggered by a new one.

use std::collections::BTreeSet;
use std::fmt;

use tracing::{debug, info, instrument, warn};

use crate::controller::context::Context;
use crate::controller::error::{Error, Result};
use crate::controller::state_machine::{
    MemberEvent, MemberState, MemberStateMachine, TransitionContext, TransitionResult,
};
use crate::resources::DriverError;

/// What caused a reconciliation pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Trigger {
    /// A peer joined or changed
    PeerChanged,
    /// A peer is leaving; its host must not be re-added
    PeerDeparted { host: String },
    /// This unit became the coordinator
    LeaderElected,
    /// Periodic status tick
    Periodic,
}

impl Trigger {
    pub fn departing_host(&self) -> Option<&str> {
        match self {
            Trigger::PeerDeparted { host } => Some(host),
            _ => None,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::PeerChanged => write!(f, "peer-changed"),
            Trigger::PeerDeparted { host } => write!(f, "peer-departed({})", host),
            Trigger::LeaderElected => write!(f, "leader-elected"),
            Trigger::Periodic => write!(f, "periodic"),
        }
    }
}

/// Membership changes for one pass
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub to_remove: BTreeSet<String>,
    pub to_add: BTreeSet<String>,
}

impl ReconcilePlan {
    pub fn compute(
        live: &BTreeSet<String>,
        desired: &BTreeSet<String>,
        departing: Option<&str>,
    ) -> Self {
        let mut plan = Self::default();
        for host in live.union(desired) {
            match MemberState::classify(host, live, desired, departing) {
                MemberState::PendingRemove => {
                    plan.to_remove.insert(host.clone());
                }
                MemberState::PendingAdd => {
                    plan.to_add.insert(host.clone());
                }
                MemberState::Active | MemberState::Absent => {}
            }
        }
        plan
    }

    pub fn is_empty(&self) -> bool {
        self.to_remove.is_empty() && self.to_add.is_empty()
    }
}

/// Result of a reconciliation pass
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Live membership already matched
    Unchanged,
    /// Every planned change was applied
    Converged {
        added: Vec<String>,
        removed: Vec<String>,
    },
    /// Additions stopped at a host that was not ready
    Deferred {
        added: Vec<String>,
        removed: Vec<String>,
        host: String,
    },
}

fn unreachable_or(err: DriverError) -> Error {
    match err {
        DriverError::Unreachable(msg) => Error::ClusterUnreachable(msg),
        other => Error::DriverError(other),
    }
}

/// Run one reconciliation pass
///
/// Only the coordinator may run this; others get `NotCoordinator`.
#[instrument(skip(ctx), fields(unit = %ctx.unit, trigger = %trigger))]
pub async fn reconcile(ctx: &Context, trigger: &Trigger) -> Result<ReconcileOutcome> {
    if !ctx.is_leader() {
        return Err(Error::NotCoordinator);
    }

    let config = ctx.mongodb_config().await?;
    let desired = config.hosts.clone();
    let conn = ctx.driver.connect(&config, None, false);
    let live = conn.get_members().await.map_err(unreachable_or)?;

    let plan = ReconcilePlan::compute(&live, &desired, trigger.departing_host());
    if plan.is_empty() {
        debug!("Replica set members match desired hosts");
        return Ok(ReconcileOutcome::Unchanged);
    }

    info!(
        remove = ?plan.to_remove,
        add = ?plan.to_add,
        "Reconfigure replica set"
    );

    let sm = MemberStateMachine::new();
    let mut removed = Vec::new();
    let mut added = Vec::new();
    let mut deferred = None;

    // Removals first: cheaper, and they shrink the voting set before it grows
    for host in &plan.to_remove {
        debug!(host = %host, "Removing member");
        conn.remove_member(host).await.map_err(unreachable_or)?;
        log_transition(
            host,
            sm.transition(
                &MemberState::PendingRemove,
                MemberEvent::RemoveApplied,
                &TransitionContext::new(ctx.is_leader(), true),
            ),
        );
        removed.push(host.clone());
        if let Some(health) = &ctx.health {
            health.metrics.record_membership_change("removed");
        }
    }

    for host in &plan.to_add {
        let direct = ctx.driver.connect(&config, Some(host), true);
        let ready = direct.is_ready().await;
        let transition = sm.transition(
            &MemberState::PendingAdd,
            MemberEvent::AddApplied,
            &TransitionContext::new(ctx.is_leader(), ready),
        );
        if let TransitionResult::GuardFailed { reason, .. } = &transition {
            info!(host = %host, "Deferring reconfigure: {}", reason);
            log_transition(
                host,
                sm.transition(
                    &MemberState::PendingAdd,
                    MemberEvent::AddDeferred,
                    &TransitionContext::new(ctx.is_leader(), ready),
                ),
            );
            deferred = Some(host.clone());
            break;
        }

        debug!(host = %host, "Adding member");
        conn.add_member(host).await.map_err(unreachable_or)?;
        log_transition(host, transition);
        added.push(host.clone());
        if let Some(health) = &ctx.health {
            health.metrics.record_membership_change("added");
        }
    }

    // Consumers only need the resulting hosts, whatever was applied
    let users = conn.get_users().await.map_err(unreachable_or)?;
    ctx.publisher.publish(&config, &users).await?;

    Ok(match deferred {
        Some(host) => ReconcileOutcome::Deferred {
            added,
            removed,
            host,
        },
        None => ReconcileOutcome::Converged { added, removed },
    })
}

fn log_transition(host: &str, result: TransitionResult) {
    match result {
        TransitionResult::Success {
            from,
            to,
            description,
            ..
        } => debug!(host = %host, from = %from, to = %to, "{}", description),
        TransitionResult::InvalidTransition { current, event } => {
            warn!(host = %host, state = %current, event = %event, "Invalid member transition")
        }
        TransitionResult::GuardFailed { event, reason, .. } => {
            debug!(host = %host, event = %event, "Transition blocked: {}", reason)
        }
    }
}
