//! Unit status and status projection
//!
//! `UnitStatus` is the single externally visible status of a unit. The
//! database and backup subsystems each produce one; `project` combines them.

use std::collections::BTreeMap;
use std::fmt;

/// Externally visible unit status
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UnitStatus {
    /// Nominal
    Active(String),
    /// An operation is running; the unit is healthy but busy
    Maintenance(String),
    /// Progressing towards a goal state
    Waiting(String),
    /// Requires intervention
    Blocked(String),
}

impl UnitStatus {
    pub fn active() -> Self {
        UnitStatus::Active(String::new())
    }

    pub fn is_active(&self) -> bool {
        matches!(self, UnitStatus::Active(_))
    }

    pub fn category(&self) -> &'static str {
        match self {
            UnitStatus::Active(_) => "active",
            UnitStatus::Maintenance(_) => "maintenance",
            UnitStatus::Waiting(_) => "waiting",
            UnitStatus::Blocked(_) => "blocked",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            UnitStatus::Active(m)
            | UnitStatus::Maintenance(m)
            | UnitStatus::Waiting(m)
            | UnitStatus::Blocked(m) => m,
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message().is_empty() {
            write!(f, "{}", self.category())
        } else {
            write!(f, "{}: {}", self.category(), self.message())
        }
    }
}

/// Whether the backup status must be polled to project the unit status
///
/// A non-nominal database status always wins, and without a backup
/// credentials relation there is no backup status to report.
pub fn backup_status_needed(database: &UnitStatus, backup_relation: bool) -> bool {
    database.is_active() && backup_relation
}

/// Combine database and backup status into the unit status
///
/// `backup` is only consulted when `backup_status_needed` holds; callers
/// pass `None` otherwise.
pub fn project(database: UnitStatus, backup_relation: bool, backup: Option<UnitStatus>) -> UnitStatus {
    if !backup_status_needed(&database, backup_relation) {
        return database;
    }
    match backup {
        Some(backup) if !backup.is_active() => backup,
        _ => database,
    }
}

/// Status of this unit derived from replica set member states
///
/// `member_states` maps member hostnames to `stateStr` values; `None`
/// means the replica set could not be queried.
pub fn database_status(
    member_states: Option<&BTreeMap<String, String>>,
    self_host: &str,
) -> UnitStatus {
    let Some(states) = member_states else {
        return UnitStatus::Waiting("Waiting for MongoDB to start".to_string());
    };
    let Some(state) = states.get(self_host) else {
        return UnitStatus::Waiting("Member being added...".to_string());
    };
    match state.as_str() {
        "PRIMARY" => UnitStatus::Active("Replica set primary".to_string()),
        "SECONDARY" => UnitStatus::Active("Replica set secondary".to_string()),
        "STARTUP" | "STARTUP2" | "ROLLBACK" | "RECOVERING" => {
            UnitStatus::Waiting("Member is syncing...".to_string())
        }
        "REMOVED" => UnitStatus::Waiting("Member is removing...".to_string()),
        other => UnitStatus::Blocked(other.to_string()),
    }
}
