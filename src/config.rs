//! Operator configuration
//!
//! Fixed paths and names shared with the workload container, plus the
//! runtime settings read from the pod environment.

use std::time::Duration;

use thiserror::Error;

/// Default MongoDB port used in member host strings and URIs
pub const MONGODB_PORT: u16 = 27017;
pub const UNIX_USER: &str = "mongodb";
pub const UNIX_GROUP: &str = "mongodb";
pub const CONF_DIR: &str = "/etc/mongod";
pub const CONTAINER_NAME: &str = "mongod";
pub const SOCKET_PATH: &str = "/tmp/mongodb-27017.sock";
pub const KEY_FILE_NAME: &str = "keyFile";
pub const MONGOSH_PATH: &str = "/usr/bin/mongosh";

/// Peer data key recording replica set initialisation
pub const DB_INITIALISED_KEY: &str = "db_initialised";
/// Unit peer data key recording that this unit is leaving the cluster
pub const UNIT_DEPARTED_KEY: &str = "unit_departed";
/// Value written for boolean peer data flags
pub const FLAG_TRUE: &str = "True";

/// Backup tool (Percona Backup for MongoDB) settings
pub mod backup {
    pub const SERVICE_NAME: &str = "pbm-agent";
    pub const PBM_PATH: &str = "/usr/bin/pbm";
    pub const PBM_CONFIG_FILE_PATH: &str = "/etc/pbm_config.yaml";
    pub const URI_ENV: &str = "PBM_MONGODB_URI";
}

/// Secret storage labels
pub mod secrets {
    /// Peer data key holding the id of the scope's secret
    pub const INTERNAL_LABEL: &str = "internal-secret";
    /// Value marking a logically deleted secret key
    pub const TOMBSTONE: &str = "None";
    pub const KEYFILE_NAME: &str = "keyfile";
    /// Key of the CA certificate; its presence turns TLS on for a scope
    pub const CA_LABEL: &str = "ca-secret";
}

/// Action parameter and result names
pub mod actions {
    pub const PASSWORD_PARAM: &str = "password";
    pub const USERNAME_PARAM: &str = "username";
    pub const BACKUP_ID_PARAM: &str = "backup-id";
    pub const SECRET_ID_RESULT: &str = "secret-id";
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid value for {name}: {value}")]
    InvalidValue { name: &'static str, value: String },
}

/// Runtime configuration for one operator agent
#[derive(Clone, Debug)]
pub struct OperatorConfig {
    /// Application name; also the replica set name
    pub app_name: String,
    /// Unit identity (`<app>/<ordinal>` or the pod name `<app>-<ordinal>`)
    pub unit_name: String,
    /// Kubernetes namespace holding pods, secrets and peer data
    pub namespace: String,
    /// Period of the `UpdateStatus` tick
    pub update_status_interval: Duration,
    /// Delay before a deferred event is redelivered
    pub defer_delay: Duration,
    /// Name of the Secret carrying S3 credentials
    pub s3_credentials_secret: String,
    /// Port of the health/action server
    pub health_port: u16,
}

impl OperatorConfig {
    pub fn new(app_name: impl Into<String>, unit_name: impl Into<String>) -> Self {
        let app_name = app_name.into();
        Self {
            s3_credentials_secret: format!("{}-s3-credentials", app_name),
            app_name,
            unit_name: unit_name.into(),
            namespace: "default".to_string(),
            update_status_interval: Duration::from_secs(300),
            defer_delay: Duration::from_secs(5),
            health_port: 8080,
        }
    }

    /// Build the configuration from the pod environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let app_name = std::env::var("APP_NAME").unwrap_or_else(|_| "mongodb".to_string());
        let unit_name = std::env::var("POD_NAME").unwrap_or_else(|_| {
            tracing::warn!("POD_NAME not set, using hostname");
            hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| format!("{}-0", app_name))
        });

        let mut config = Self::new(app_name, unit_name);

        if let Ok(ns) = std::env::var("POD_NAMESPACE") {
            config.namespace = ns;
        } else {
            tracing::warn!("POD_NAMESPACE not set, using 'default'");
        }
        if let Ok(name) = std::env::var("S3_CREDENTIALS_SECRET") {
            config.s3_credentials_secret = name;
        }
        if let Some(secs) = parse_env_u64("UPDATE_STATUS_INTERVAL_SECS")? {
            config.update_status_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_env_u64("DEFER_DELAY_SECS")? {
            config.defer_delay = Duration::from_secs(secs);
        }
        if let Some(port) = parse_env_u64("HEALTH_PORT")? {
            config.health_port = u16::try_from(port).map_err(|_| ConfigError::InvalidValue {
                name: "HEALTH_PORT",
                value: port.to_string(),
            })?;
        }

        Ok(config)
    }

    /// Replica set name used by the cluster
    pub fn replset(&self) -> &str {
        &self.app_name
    }
}

fn parse_env_u64(name: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value }),
        Err(_) => Ok(None),
    }
}
