//! Percona Backup for MongoDB CLI
//!
//! `PbmCli` runs `pbm` in the workload container with the backup user's
//! connection string. The rest of this module turns `pbm status -o json`
//! output and pbm's error text into `BackupState` values and messages.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, LazyLock};

use regex::Regex;
use serde::Deserialize;
use tracing::{debug, error};

use crate::config::backup::{PBM_PATH, SERVICE_NAME, URI_ENV};
use crate::controller::status::UnitStatus;
use crate::resources::workload::{Workload, WorkloadError};

pub const STATUS_ARGS: [&str; 3] = ["status", "-o", "json"];

pub const RESYNC_WAITING_MESSAGE: &str = "waiting to sync s3 configurations.";
pub const SERVICE_WAITING_MESSAGE: &str = "waiting for pbm to start";
pub const GENERIC_ERROR_MESSAGE: &str = "PBM error";
const DEFAULT_ERROR_MESSAGE: &str = "couldn't configure s3 backup option";

static TOPOLOGY_MISMATCH: LazyLock<Option<Regex>> = LazyLock::new(|| {
    // Names run up to the first comma, whitespace or sentence end
    Regex::new(r"(?s)Backup doesn't match current cluster topology.*?are: ([^,\s.]+)").ok()
});

/// State of the backup tool as seen by the operator
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackupState {
    /// A backup or restore is running
    Maintenance(String),
    /// A resync is running or the agent is not up yet
    Waiting(String),
    /// The tool reports an error that needs intervention
    Blocked(String),
    /// Idle and accepting operations
    Active,
}

impl BackupState {
    pub fn is_active(&self) -> bool {
        matches!(self, BackupState::Active)
    }
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        UnitStatus::from(self.clone()).fmt(f)
    }
}

impl From<BackupState> for UnitStatus {
    fn from(state: BackupState) -> Self {
        match state {
            BackupState::Maintenance(m) => UnitStatus::Maintenance(m),
            BackupState::Waiting(m) => UnitStatus::Waiting(m),
            BackupState::Blocked(m) => UnitStatus::Blocked(m),
            BackupState::Active => UnitStatus::active(),
        }
    }
}

/// Operation pbm reports as running
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct RunningOperation {
    #[serde(rename = "type", default)]
    pub op_type: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct Snapshot {
    pub name: String,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "type", default)]
    pub backup_type: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct BackupList {
    #[serde(default)]
    pub snapshot: Option<Vec<Snapshot>>,
}

/// Subset of `pbm status -o json` the operator reads
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Eq)]
pub struct PbmStatus {
    #[serde(default)]
    pub running: Option<RunningOperation>,
    #[serde(default)]
    pub backups: Option<BackupList>,
    #[serde(default)]
    pub error: Option<String>,
}

impl PbmStatus {
    pub fn parse(output: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(output)
    }

    /// Type of the running operation, lowercased; empty when idle
    pub fn current_operation(&self) -> String {
        self.running
            .as_ref()
            .and_then(|op| op.op_type.as_deref())
            .unwrap_or_default()
            .to_ascii_lowercase()
    }

    pub fn is_resyncing(&self) -> bool {
        self.current_operation() == "resync"
    }

    pub fn snapshots(&self) -> &[Snapshot] {
        self.backups
            .as_ref()
            .and_then(|b| b.snapshot.as_deref())
            .unwrap_or_default()
    }
}

/// Classify a parsed status
pub fn classify(status: &PbmStatus) -> BackupState {
    if let Some(error) = status.error.as_deref().filter(|e| !e.trim().is_empty()) {
        return BackupState::Blocked(process_pbm_error(error));
    }
    let name = status
        .running
        .as_ref()
        .and_then(|op| op.name.clone())
        .unwrap_or_default();
    match status.current_operation().as_str() {
        "backup" => {
            BackupState::Maintenance(format!("backup started/running, backup id:'{}'", name))
        }
        "restore" => {
            BackupState::Maintenance(format!("restore started/running, backup id:'{}'", name))
        }
        "resync" => BackupState::Waiting(RESYNC_WAITING_MESSAGE.to_string()),
        _ => BackupState::Active,
    }
}

/// Classify raw status output; unparseable output is a generic error
pub fn classify_output(output: &str) -> BackupState {
    match PbmStatus::parse(output) {
        Ok(status) => classify(&status),
        Err(e) => {
            error!("Failed to parse pbm status: {}", e);
            BackupState::Blocked(GENERIC_ERROR_MESSAGE.to_string())
        }
    }
}

/// Human-readable message for pbm error output
pub fn process_pbm_error(output: &str) -> String {
    if output.contains("status code: 403") {
        return "s3 credentials are incorrect.".to_string();
    }
    if output.contains("status code: 404") || output.contains("status code: 301") {
        return "s3 configurations are incompatible.".to_string();
    }
    if let Some(name) = topology_mismatch(output) {
        return format!("backup has an unknown replica set name: {}.", name);
    }
    DEFAULT_ERROR_MESSAGE.to_string()
}

/// First extra replica set name from a topology mismatch diagnostic
pub fn topology_mismatch(text: &str) -> Option<String> {
    TOPOLOGY_MISMATCH
        .as_ref()?
        .captures(text)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// `--replset-remapping` value for restoring `backup_id` into `replset`
///
/// Only needed when the backup was taken from a replica set with another
/// name, which pbm reports as a topology mismatch on the snapshot.
pub fn replset_remapping(status: &PbmStatus, backup_id: &str, replset: &str) -> Option<String> {
    let snapshot = status.snapshots().iter().find(|s| s.name == backup_id)?;
    let old = topology_mismatch(snapshot.error.as_deref()?)?;
    Some(format!("{}={}", replset, old))
}

/// Render the backup list as a table sorted by backup id
pub fn format_backup_list(status: &PbmStatus) -> String {
    let mut rows: BTreeMap<String, (String, String)> = BTreeMap::new();
    for snapshot in status.snapshots() {
        let backup_status = match snapshot.status.as_str() {
            "done" => "finished".to_string(),
            "error" => format!(
                "failed: {}",
                snapshot.error.as_deref().unwrap_or_default()
            ),
            _ => "in progress".to_string(),
        };
        let backup_type = snapshot.backup_type.clone().unwrap_or_else(|| "logical".into());
        rows.insert(snapshot.name.clone(), (backup_type, backup_status));
    }

    // pbm sometimes reports the running backup as failed
    if status.current_operation() == "backup"
        && let Some(name) = status.running.as_ref().and_then(|op| op.name.clone())
    {
        let entry = rows
            .entry(name)
            .or_insert_with(|| ("logical".to_string(), String::new()));
        entry.1 = "in progress".to_string();
    }

    let header = format!("{:<21} | {:<12} | {}", "backup-id", "backup-type", "backup-status");
    let mut lines = vec![header.clone(), "-".repeat(header.len())];
    for (id, (backup_type, backup_status)) in rows {
        lines.push(format!("{:<21} | {:<12} | {}", id, backup_type, backup_status));
    }
    lines.join("\n")
}

/// `pbm` invocations against the workload
#[derive(Clone)]
pub struct PbmCli {
    workload: Arc<dyn Workload>,
    uri: String,
}

impl PbmCli {
    /// `uri` is the backup user's connection string
    pub fn new(workload: Arc<dyn Workload>, uri: impl Into<String>) -> Self {
        Self {
            workload,
            uri: uri.into(),
        }
    }

    pub fn workload(&self) -> &Arc<dyn Workload> {
        &self.workload
    }

    pub async fn run(&self, args: &[&str]) -> Result<String, WorkloadError> {
        let mut command = vec![PBM_PATH.to_string()];
        command.extend(args.iter().map(|a| a.to_string()));
        let env = BTreeMap::from([(URI_ENV.to_string(), self.uri.clone())]);
        debug!(args = ?args, "Running pbm");
        self.workload.exec(&command, &env, None).await
    }

    pub async fn status(&self) -> Result<String, WorkloadError> {
        self.run(&STATUS_ARGS).await
    }

    pub async fn service_exists(&self) -> Result<bool, WorkloadError> {
        self.workload.service_exists(SERVICE_NAME).await
    }

    pub async fn start_service(&self) -> Result<(), WorkloadError> {
        self.workload.start_service(SERVICE_NAME).await
    }

    pub async fn restart_service(&self) -> Result<(), WorkloadError> {
        self.workload.restart_service(SERVICE_NAME).await
    }
}
