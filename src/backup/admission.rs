//! Admission control for backup actions
//!
//! Prerequisites are checked first and never touch pbm. Only when they pass
//! is the polled backup state consulted:
//!
//! | state       | create-backup | list-backups | restore |
//! |-------------|---------------|--------------|---------|
//! | maintenance | reject        | proceed      | reject  |
//! | waiting     | defer         | defer        | defer   |
//! | blocked     | reject        | reject       | reject  |
//! | active      | proceed       | proceed      | proceed |

use std::fmt;

use crate::backup::pbm::BackupState;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BackupAction {
    CreateBackup,
    ListBackups,
    Restore { backup_id: Option<String> },
}

impl BackupAction {
    /// Actions that start a pbm operation may only run on the coordinator
    pub fn is_mutating(&self) -> bool {
        !matches!(self, BackupAction::ListBackups)
    }

    fn verb(&self) -> &'static str {
        match self {
            BackupAction::CreateBackup => "create backup",
            BackupAction::ListBackups => "list backups",
            BackupAction::Restore { .. } => "restore from a backup",
        }
    }
}

impl fmt::Display for BackupAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackupAction::CreateBackup => write!(f, "create-backup"),
            BackupAction::ListBackups => write!(f, "list-backups"),
            BackupAction::Restore { .. } => write!(f, "restore"),
        }
    }
}

/// Admission decision
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    /// Fail the action with this message
    Reject(String),
    /// Redeliver the action later
    Defer(String),
}

/// Checks that need no backup state
///
/// Returns `None` when the action may go on to the state check.
pub fn precheck(action: &BackupAction, relation_present: bool, is_coordinator: bool) -> Option<Admission> {
    if !relation_present {
        return Some(Admission::Reject(format!(
            "Relation with s3-integrator charm missing, cannot {}.",
            action.verb()
        )));
    }

    if let BackupAction::Restore { backup_id } = action
        && backup_id.as_deref().is_none_or(str::is_empty)
    {
        return Some(Admission::Reject("Missing backup-id to restore".to_string()));
    }

    if action.is_mutating() && !is_coordinator {
        return Some(Admission::Reject(
            "The action can be run only on leader unit.".to_string(),
        ));
    }

    None
}

/// Decision for an action that passed `precheck`
pub fn admit(action: &BackupAction, state: &BackupState) -> Admission {
    match (action, state) {
        (_, BackupState::Active) => Admission::Proceed,
        (_, BackupState::Waiting(_)) => Admission::Defer(format!(
            "Sync-ing configurations needs more time, must wait before {}.",
            match action {
                BackupAction::CreateBackup => "creating a backup",
                BackupAction::ListBackups => "listing backups",
                BackupAction::Restore { .. } => "restoring",
            }
        )),
        (BackupAction::ListBackups, BackupState::Maintenance(_)) => Admission::Proceed,
        (BackupAction::CreateBackup, BackupState::Maintenance(_)) => Admission::Reject(
            "Can only create one backup at a time, please wait for current backup to finish."
                .to_string(),
        ),
        (BackupAction::Restore { .. }, BackupState::Maintenance(_)) => {
            Admission::Reject("Please wait for current backup/restore to finish.".to_string())
        }
        (BackupAction::CreateBackup, BackupState::Blocked(m)) => {
            Admission::Reject(format!("Cannot create backup {}.", m))
        }
        (BackupAction::ListBackups, BackupState::Blocked(m)) => {
            Admission::Reject(format!("Cannot list backups: {}.", m))
        }
        (BackupAction::Restore { .. }, BackupState::Blocked(m)) => {
            Admission::Reject(format!("Cannot restore backup {}.", m))
        }
    }
}
