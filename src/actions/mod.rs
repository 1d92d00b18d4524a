//! Action surface
//!
//! Operator actions are invoked over HTTP (`POST /actions/<name>` with a
//! JSON object of string parameters). Each request is handed to the event
//! dispatcher like any other event, so an action never runs concurrently
//! with a handler.

use std::collections::BTreeMap;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::backup::BackupAction;
use crate::config::actions::{BACKUP_ID_PARAM, PASSWORD_PARAM, USERNAME_PARAM};
use crate::controller::dispatch::Event;

/// A parsed action invocation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionRequest {
    GetPassword {
        username: Option<String>,
    },
    SetPassword {
        username: Option<String>,
        password: Option<String>,
    },
    Backup(BackupAction),
}

impl ActionRequest {
    /// Build a request from the action name and its parameters
    pub fn parse(name: &str, mut params: BTreeMap<String, String>) -> Option<Self> {
        let request = match name {
            "get-password" => ActionRequest::GetPassword {
                username: params.remove(USERNAME_PARAM),
            },
            "set-password" => ActionRequest::SetPassword {
                username: params.remove(USERNAME_PARAM),
                password: params.remove(PASSWORD_PARAM),
            },
            "create-backup" => ActionRequest::Backup(BackupAction::CreateBackup),
            "list-backups" => ActionRequest::Backup(BackupAction::ListBackups),
            "restore" => ActionRequest::Backup(BackupAction::Restore {
                backup_id: params.remove(BACKUP_ID_PARAM),
            }),
            _ => return None,
        };
        Some(request)
    }

    pub fn name(&self) -> String {
        match self {
            ActionRequest::GetPassword { .. } => "get-password".to_string(),
            ActionRequest::SetPassword { .. } => "set-password".to_string(),
            ActionRequest::Backup(action) => action.to_string(),
        }
    }
}

/// Result of an action
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ActionOutcome {
    Success(BTreeMap<String, String>),
    /// The action failed; the message is meant for the caller
    Failed(String),
    /// The action cannot run yet; the caller should retry later
    Deferred(String),
}

impl ActionOutcome {
    pub fn success<K: Into<String>, V: Into<String>>(results: impl IntoIterator<Item = (K, V)>) -> Self {
        ActionOutcome::Success(
            results
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    pub fn failed(message: impl Into<String>) -> Self {
        ActionOutcome::Failed(message.into())
    }
}

#[derive(Debug, Serialize)]
struct ActionResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    results: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl ActionOutcome {
    fn into_response_parts(self) -> (StatusCode, ActionResponse) {
        match self {
            ActionOutcome::Success(results) => (
                StatusCode::OK,
                ActionResponse {
                    results: Some(results),
                    message: None,
                },
            ),
            ActionOutcome::Failed(message) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                ActionResponse {
                    results: None,
                    message: Some(message),
                },
            ),
            ActionOutcome::Deferred(message) => (
                StatusCode::SERVICE_UNAVAILABLE,
                ActionResponse {
                    results: None,
                    message: Some(message),
                },
            ),
        }
    }
}

/// Create the action router feeding `events`
pub fn create_router(events: mpsc::Sender<Event>) -> Router {
    Router::new()
        .route("/actions/{name}", post(run_action))
        .with_state(events)
}

async fn run_action(
    State(events): State<mpsc::Sender<Event>>,
    Path(name): Path<String>,
    Json(params): Json<BTreeMap<String, String>>,
) -> impl IntoResponse {
    let Some(request) = ActionRequest::parse(&name, params) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ActionResponse {
                results: None,
                message: Some(format!("Unknown action {}", name)),
            }),
        );
    };

    info!(action = %name, "Action requested");
    let (reply, outcome) = oneshot::channel();
    if events.send(Event::Action { request, reply }).await.is_err() {
        warn!(action = %name, "Event dispatcher is not running");
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ActionResponse {
                results: None,
                message: Some("operator is shutting down".to_string()),
            }),
        );
    }

    let outcome = outcome
        .await
        .unwrap_or_else(|_| ActionOutcome::failed("action was dropped"));
    let (status, body) = outcome.into_response_parts();
    (status, Json(body))
}
