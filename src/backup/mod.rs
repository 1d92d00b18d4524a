//! Backup configuration and coordination with Percona Backup for MongoDB

pub mod admission;
pub mod configurator;
pub mod coordinator;
pub mod pbm;

use thiserror::Error;

use crate::resources::workload::WorkloadError;

pub use admission::{Admission, BackupAction};
pub use configurator::{BackupConfigurator, S3Credentials, pbm_options};
pub use coordinator::{BackupCoordinator, SyncPolicies};
pub use pbm::{BackupState, PbmCli, PbmStatus};

#[derive(Error, Debug)]
pub enum BackupError {
    /// pbm is running another operation
    #[error("PBM is busy running an operation")]
    Busy,

    /// A resync is still in progress
    #[error("PBM is resyncing configurations")]
    Resyncing,

    #[error("Failed to configure the PBM option {key}")]
    Configuration { key: String },

    /// pbm reported an error that needs intervention
    #[error("{0}")]
    Tool(String),

    #[error("The pbm-agent service is not available")]
    ServiceUnavailable,

    #[error("Workload error: {0}")]
    Workload(#[from] WorkloadError),
}

impl BackupError {
    /// Conditions that clear on their own once pbm catches up
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackupError::Busy | BackupError::Resyncing | BackupError::ServiceUnavailable
        )
    }
}
