//! Error types for the operator controller

use thiserror::Error;

use crate::backup::BackupError;
use crate::controller::membership::MembershipError;
use crate::resources::{DriverError, PeerStoreError, SecretError, WorkloadError};

/// Variants wrapping a component error carry its name; the rest describe
/// the handler-level condition.
#[allow(clippy::enum_variant_names)]
#[derive(Error, Debug)]
pub enum Error {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Workload error: {0}")]
    WorkloadError(#[from] WorkloadError),

    #[error("Driver error: {0}")]
    DriverError(#[from] DriverError),

    #[error("Secret error: {0}")]
    SecretError(#[from] SecretError),

    #[error("Peer data error: {0}")]
    PeerStoreError(#[from] PeerStoreError),

    #[error("Backup error: {0}")]
    BackupError(#[from] BackupError),

    #[error("Membership error: {0}")]
    MembershipError(#[from] MembershipError),

    /// A mutation was attempted by a unit that is not the coordinator
    #[error("Not the coordinator")]
    NotCoordinator,

    #[error("Secret {0} is not available")]
    MissingSecret(String),

    /// No replica set member answered
    #[error("Cluster unreachable: {0}")]
    ClusterUnreachable(String),

    /// A prerequisite is still converging
    #[error("Not ready: {0}")]
    NotReady(String),
}

impl Error {
    /// Whether redelivering the event later may succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::KubeError(e) => match e {
                kube::Error::Api(api_err) => {
                    let code = api_err.code;
                    if (400..500).contains(&code) {
                        return code == 404 || code == 409 || code == 429;
                    }
                    true
                }
                _ => true,
            },
            // Membership convergence self-corrects on the next trigger
            Error::DriverError(_) => true,
            Error::ClusterUnreachable(_) => true,
            Error::NotReady(_) => true,
            Error::WorkloadError(_) => true,
            Error::PeerStoreError(_) => true,
            Error::SecretError(_) => true,
            Error::MissingSecret(_) => true,
            Error::BackupError(e) => e.is_transient(),
            Error::NotCoordinator => false,
            Error::SerializationError(_) => false,
            Error::MembershipError(_) => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Request to redeliver the current event later
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Retry {
    pub reason: String,
}

impl Retry {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl std::fmt::Display for Retry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "retry: {}", self.reason)
    }
}

impl From<Error> for Retry {
    fn from(err: Error) -> Self {
        Retry::new(err.to_string())
    }
}

/// Outcome of an event handler
pub type Handled = std::result::Result<(), Retry>;
