//! Event dispatch
//!
//! One handler runs at a time. Events that come back with `Retry` are
//! re-queued after the defer delay; redelivery is at-least-once and carries
//! no ordering guarantee relative to newer events.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::actions::{ActionOutcome, ActionRequest};
use crate::backup::S3Credentials;
use crate::controller::context::Context;
use crate::controller::error::Handled;
use crate::controller::handlers;
use crate::controller::membership::UnitId;
use crate::controller::reconciler::Trigger;

/// Events delivered to the agent
#[derive(Debug)]
pub enum Event {
    Start,
    PeerChanged,
    PeerDeparted {
        unit: UnitId,
    },
    LeaderElected,
    UpdateStatus,
    CredentialsChanged(Option<S3Credentials>),
    SecretChanged {
        id: String,
    },
    Stop,
    Action {
        request: ActionRequest,
        reply: oneshot::Sender<ActionOutcome>,
    },
}

impl Event {
    /// Metric label for the event
    pub fn kind(&self) -> &'static str {
        match self {
            Event::Start => "start",
            Event::PeerChanged => "peer-changed",
            Event::PeerDeparted { .. } => "peer-departed",
            Event::LeaderElected => "leader-elected",
            Event::UpdateStatus => "update-status",
            Event::CredentialsChanged(_) => "credentials-changed",
            Event::SecretChanged { .. } => "secret-changed",
            Event::Stop => "stop",
            Event::Action { .. } => "action",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::PeerDeparted { unit } => write!(f, "peer-departed({})", unit),
            Event::Action { request, .. } => write!(f, "action({})", request.name()),
            other => write!(f, "{}", other.kind()),
        }
    }
}

/// Run one event; returns the event when it must be delivered again
pub async fn dispatch(ctx: &Context, event: Event) -> Option<Event> {
    // Secrets may have changed since the last event
    ctx.secrets.invalidate().await;

    let kind = event.kind();
    let started = Instant::now();
    debug!(event = %event, "Dispatching");

    let handled: Handled = match &event {
        Event::Start => handlers::on_start(ctx).await,
        Event::PeerChanged => handlers::on_peer_changed(ctx, Trigger::PeerChanged).await,
        Event::PeerDeparted { unit } => handlers::on_peer_departed(ctx, unit).await,
        Event::LeaderElected => handlers::on_peer_changed(ctx, Trigger::LeaderElected).await,
        Event::UpdateStatus => handlers::on_update_status(ctx).await,
        Event::CredentialsChanged(credentials) => {
            handlers::on_credentials_changed(ctx, credentials.clone()).await
        }
        Event::SecretChanged { id } => handlers::on_secret_changed(ctx, id).await,
        Event::Stop => handlers::on_stop(ctx).await,
        Event::Action { .. } => Ok(()),
    };

    let event = match event {
        Event::Action { request, reply } => {
            let outcome = run_action(ctx, &request).await;
            if let ActionOutcome::Deferred(reason) = &outcome {
                info!(action = %request.name(), "Action deferred: {}", reason);
            }
            if reply.send(outcome).is_err() {
                warn!(action = %request.name(), "Action caller went away");
            }
            None
        }
        event => Some(event),
    };

    if let Some(health) = &ctx.health {
        health.metrics.record_event(kind, started.elapsed().as_secs_f64());
        health.touch();
    }

    match (handled, event) {
        (Err(retry), Some(event)) => {
            info!(event = %event, "Event deferred: {}", retry.reason);
            if let Some(health) = &ctx.health {
                health.metrics.record_deferred(kind);
            }
            Some(event)
        }
        _ => None,
    }
}

async fn run_action(ctx: &Context, request: &ActionRequest) -> ActionOutcome {
    match request {
        ActionRequest::GetPassword { username } => {
            handlers::get_password(ctx, username.as_deref()).await
        }
        ActionRequest::SetPassword { username, password } => {
            handlers::set_password(ctx, username.as_deref(), password.as_deref()).await
        }
        ActionRequest::Backup(action) => handlers::run_backup_action(ctx, action).await,
    }
}

/// Deliver events from `events` until `Stop` is handled or every sender
/// is gone
///
/// `requeue` must feed the same channel; deferred events are sent back on it
/// after the configured defer delay. It is weak so that pending retries do
/// not keep the dispatcher alive.
pub async fn run_dispatcher(
    ctx: Arc<Context>,
    requeue: mpsc::WeakSender<Event>,
    mut events: mpsc::Receiver<Event>,
) {
    info!(unit = %ctx.unit, "Event dispatcher started");
    if let Some(health) = &ctx.health {
        health.set_ready(true).await;
    }

    while let Some(event) = events.recv().await {
        let stopping = matches!(event, Event::Stop);
        if let Some(event) = dispatch(&ctx, event).await {
            let requeue = requeue.clone();
            let sleeper = ctx.sleeper.clone();
            let delay = ctx.config.defer_delay;
            tokio::spawn(async move {
                sleeper.sleep(delay).await;
                let Some(requeue) = requeue.upgrade() else {
                    debug!("Dispatcher stopped, dropping deferred event");
                    return;
                };
                if requeue.send(event).await.is_err() {
                    debug!("Dispatcher stopped, dropping deferred event");
                }
            });
        }
        if stopping {
            break;
        }
    }

    info!("Event dispatcher stopped");
}
