//! Shared context for event handlers

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;
use tracing::debug;

use crate::backup::{BackupCoordinator, PbmCli, S3Credentials, SyncPolicies};
use crate::config::secrets::CA_LABEL;
use crate::config::{DB_INITIALISED_KEY, FLAG_TRUE, OperatorConfig, UNIT_DEPARTED_KEY};
use crate::controller::error::{Error, Result};
use crate::controller::membership::{UnitId, desired_hosts};
use crate::controller::retry::Sleeper;
use crate::controller::users::{BACKUP, MONITOR, MongoUser, OPERATOR};
use crate::health::HealthState;
use crate::resources::connections::ConnectionPublisher;
use crate::resources::inventory::Inventory;
use crate::resources::status_reporter::StatusReporter;
use crate::resources::{
    ClusterDriver, MongoConfiguration, PeerStore, Scope, SecretStore, Workload,
};

/// External collaborators of the handlers
#[derive(Clone)]
pub struct Collaborators {
    pub workload: Arc<dyn Workload>,
    pub driver: Arc<dyn ClusterDriver>,
    pub peers: Arc<dyn PeerStore>,
    pub secrets: Arc<SecretStore>,
    pub inventory: Arc<dyn Inventory>,
    pub publisher: Arc<dyn ConnectionPublisher>,
    pub reporter: Arc<dyn StatusReporter>,
    pub sleeper: Arc<dyn Sleeper>,
}

/// Shared context for the controller
pub struct Context {
    pub config: OperatorConfig,
    /// Identity of this unit
    pub unit: UnitId,
    pub workload: Arc<dyn Workload>,
    pub driver: Arc<dyn ClusterDriver>,
    pub peers: Arc<dyn PeerStore>,
    pub secrets: Arc<SecretStore>,
    pub inventory: Arc<dyn Inventory>,
    pub publisher: Arc<dyn ConnectionPublisher>,
    pub reporter: Arc<dyn StatusReporter>,
    pub sleeper: Arc<dyn Sleeper>,
    /// Health state for metrics
    pub health: Option<Arc<HealthState>>,
    pub sync_policies: SyncPolicies,
    leader: Arc<AtomicBool>,
    s3_credentials: RwLock<Option<S3Credentials>>,
}

impl Context {
    pub fn new(
        config: OperatorConfig,
        unit: UnitId,
        collaborators: Collaborators,
        leader: Arc<AtomicBool>,
    ) -> Self {
        let Collaborators {
            workload,
            driver,
            peers,
            secrets,
            inventory,
            publisher,
            reporter,
            sleeper,
        } = collaborators;
        Self {
            config,
            unit,
            workload,
            driver,
            peers,
            secrets,
            inventory,
            publisher,
            reporter,
            sleeper,
            health: None,
            sync_policies: SyncPolicies::default(),
            leader,
            s3_credentials: RwLock::new(None),
        }
    }

    pub fn with_health(mut self, health: Arc<HealthState>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn with_sync_policies(mut self, policies: SyncPolicies) -> Self {
        self.sync_policies = policies;
        self
    }

    /// Whether this unit currently holds the coordinator role
    pub fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    /// Hostname of this unit as a replica set member
    pub fn hostname(&self) -> String {
        self.unit.hostname()
    }

    pub async fn db_initialised(&self) -> Result<bool> {
        Ok(self.peers.get(Scope::App, DB_INITIALISED_KEY).await?.as_deref() == Some(FLAG_TRUE))
    }

    pub async fn set_db_initialised(&self) -> Result<()> {
        self.peers.set(Scope::App, DB_INITIALISED_KEY, FLAG_TRUE).await?;
        Ok(())
    }

    pub async fn is_user_created(&self, user: &MongoUser) -> Result<bool> {
        Ok(self.peers.get(Scope::App, &user.created_flag()).await?.is_some())
    }

    pub async fn set_user_created(&self, user: &MongoUser) -> Result<()> {
        self.peers
            .set(Scope::App, &user.created_flag(), FLAG_TRUE)
            .await?;
        Ok(())
    }

    pub async fn unit_departed(&self) -> Result<bool> {
        Ok(self.peers.get(Scope::Unit, UNIT_DEPARTED_KEY).await?.as_deref() == Some(FLAG_TRUE))
    }

    /// Desired member hostnames: this unit plus its peers
    pub async fn desired_hosts(&self) -> Result<BTreeSet<String>> {
        let peers = self.inventory.peer_units().await?;
        Ok(desired_hosts(&self.unit, &peers))
    }

    /// Connection settings for `user` against `hosts`
    pub async fn user_config(
        &self,
        user: &MongoUser,
        hosts: BTreeSet<String>,
    ) -> Result<MongoConfiguration> {
        let password = self
            .secrets
            .get(Scope::App, &user.password_key())
            .await?
            .ok_or_else(|| Error::MissingSecret(format!("{}:{}", Scope::App, user.password_key())))?;
        let tls_external = self.secrets.get(Scope::Unit, CA_LABEL).await?.is_some();
        let tls_internal = self.secrets.get(Scope::App, CA_LABEL).await?.is_some();
        Ok(MongoConfiguration {
            replset: self.config.replset().to_string(),
            database: user.database.to_string(),
            username: user.username.to_string(),
            password,
            hosts,
            roles: user.roles.iter().map(|r| r.to_string()).collect(),
            tls_external,
            tls_internal,
        })
    }

    /// Operator user against every desired member
    pub async fn mongodb_config(&self) -> Result<MongoConfiguration> {
        let hosts = self.desired_hosts().await?;
        self.user_config(&OPERATOR, hosts).await
    }

    /// Backup user against this unit only
    pub async fn backup_config(&self) -> Result<MongoConfiguration> {
        self.user_config(&BACKUP, BTreeSet::from([self.hostname()]))
            .await
    }

    /// Monitor user against this unit only
    pub async fn monitor_config(&self) -> Result<MongoConfiguration> {
        self.user_config(&MONITOR, BTreeSet::from([self.hostname()]))
            .await
    }

    pub async fn s3_credentials(&self) -> Option<S3Credentials> {
        self.s3_credentials.read().await.clone()
    }

    pub async fn set_s3_credentials(&self, credentials: Option<S3Credentials>) {
        debug!(present = credentials.is_some(), "S3 credentials updated");
        *self.s3_credentials.write().await = credentials;
    }

    /// Whether the S3 credentials relation is established
    pub async fn backup_relation_present(&self) -> bool {
        self.s3_credentials.read().await.is_some()
    }

    /// Coordinator bound to the backup user's connection
    pub async fn backup_coordinator(&self) -> Result<BackupCoordinator> {
        let uri = self.backup_config().await?.uri();
        let pbm = PbmCli::new(self.workload.clone(), uri);
        Ok(
            BackupCoordinator::new(pbm, self.sleeper.clone(), self.reporter.clone())
                .with_policies(self.sync_policies),
        )
    }
}
