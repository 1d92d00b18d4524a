pub mod common;
pub mod connections;
pub mod driver;
pub mod inventory;
pub mod peer_data;
pub mod secret;
pub mod status_reporter;
pub mod workload;

pub use driver::{ClusterConnection, ClusterDriver, DriverError, MongoConfiguration, MongoshDriver};
pub use peer_data::{PeerStore, PeerStoreError, Scope};
pub use secret::{SecretBackend, SecretError, SecretStore};
pub use workload::{FileOwner, Workload, WorkloadError};
