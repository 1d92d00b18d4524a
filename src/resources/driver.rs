//! Cluster driver
//!
//! `ClusterDriver` hands out scoped connections to the replica set (or to a
//! single member when `direct` is set). `MongoshDriver` implements it by
//! running `mongosh --eval` inside the workload container and reading back
//! EJSON, so the operator needs no wire-protocol client of its own.
//! Connection strings and passwords are handed to mongosh through its
//! environment, never its arguments.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;
use urlencoding::encode;

use crate::config::{MONGODB_PORT, MONGOSH_PATH};
use crate::resources::workload::{Workload, WorkloadError};

/// Member states reported while a node is still catching up
const SYNCING_STATES: [&str; 4] = ["STARTUP", "STARTUP2", "ROLLBACK", "RECOVERING"];

/// MongoDB error code for an already initiated replica set
const ALREADY_INITIALIZED: &str = "AlreadyInitialized";

/// Environment of a mongosh invocation
const URI_ENV: &str = "MONGOSH_URI";
const PASSWORD_ENV: &str = "MONGOSH_PASSWORD";

#[derive(Error, Debug)]
pub enum DriverError {
    /// A member is mid-sync; membership changes must wait
    #[error("Replica set not ready: {0}")]
    NotReady(String),

    /// No member answered
    #[error("Cluster unreachable: {0}")]
    Unreachable(String),

    #[error("Command failed: {0}")]
    Command(String),

    #[error("Unexpected driver response: {0}")]
    Response(#[from] serde_json::Error),

    #[error("Workload error: {0}")]
    Workload(WorkloadError),
}

impl From<WorkloadError> for DriverError {
    fn from(err: WorkloadError) -> Self {
        match err {
            WorkloadError::Exec { stdout, stderr, .. } => {
                let text = format!("{}{}", stderr, stdout);
                if is_connection_failure(&text) {
                    DriverError::Unreachable(first_line(&text))
                } else {
                    DriverError::Command(first_line(&text))
                }
            }
            other => DriverError::Workload(other),
        }
    }
}

fn is_connection_failure(text: &str) -> bool {
    [
        "ECONNREFUSED",
        "MongoServerSelectionError",
        "MongoNetworkError",
        "ENOTFOUND",
        "connect ETIMEDOUT",
    ]
    .iter()
    .any(|marker| text.contains(marker))
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("unknown error")
        .to_string()
}

/// Connection settings for one database user
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MongoConfiguration {
    pub replset: String,
    pub database: String,
    pub username: String,
    pub password: String,
    pub hosts: BTreeSet<String>,
    pub roles: BTreeSet<String>,
    pub tls_external: bool,
    pub tls_internal: bool,
}

impl MongoConfiguration {
    /// Replica set connection string for this user
    pub fn uri(&self) -> String {
        let hosts: Vec<String> = self
            .hosts
            .iter()
            .map(|h| format!("{}:{}", h, MONGODB_PORT))
            .collect();
        format!(
            "mongodb://{}:{}@{}/{}?replicaSet={}&authSource=admin",
            encode(&self.username),
            encode(&self.password),
            hosts.join(","),
            self.database,
            self.replset
        )
    }

    /// Connection string pinned to a single host
    pub fn direct_uri(&self, host: &str) -> String {
        format!(
            "mongodb://{}:{}@{}:{}/{}?directConnection=true&authSource=admin",
            encode(&self.username),
            encode(&self.password),
            host,
            MONGODB_PORT,
            self.database
        )
    }
}

/// `mongosh` invocation connecting through `$MONGOSH_URI` and printing
/// `expression` as relaxed EJSON
fn mongosh_command(mongosh: &str, expression: &str) -> Vec<String> {
    let script = format!(
        "db = connect(process.env.{}); EJSON.stringify({}, {{relaxed: true}})",
        URI_ENV, expression
    );
    vec![
        mongosh.to_string(),
        "--nodb".to_string(),
        "--quiet".to_string(),
        "--eval".to_string(),
        script,
    ]
}

/// Strip the port from a `host:port` member string
pub fn member_hostname(host: &str) -> &str {
    host.rsplit_once(':').map(|(h, _)| h).unwrap_or(host)
}

/// Opens connections to the cluster
pub trait ClusterDriver: Send + Sync {
    /// `host = None` targets the replica set; `direct` pins the connection
    /// to `host` without replica set discovery.
    fn connect(
        &self,
        config: &MongoConfiguration,
        host: Option<&str>,
        direct: bool,
    ) -> Box<dyn ClusterConnection>;
}

/// Operations on a connected cluster or member
#[async_trait]
pub trait ClusterConnection: Send + Sync {
    async fn is_ready(&self) -> bool;

    /// Hostnames (without port) in the live replica set configuration
    async fn get_members(&self) -> Result<BTreeSet<String>, DriverError>;

    /// Member state names keyed by hostname, from replica set status
    async fn get_member_states(&self) -> Result<BTreeMap<String, String>, DriverError>;

    async fn add_member(&self, host: &str) -> Result<(), DriverError>;

    async fn remove_member(&self, host: &str) -> Result<(), DriverError>;

    /// Initiate the replica set with the connected host as sole member
    async fn init_replset(&self) -> Result<(), DriverError>;

    async fn create_user(&self, config: &MongoConfiguration) -> Result<(), DriverError>;

    async fn create_role(&self, role: &str, privileges: &Value) -> Result<(), DriverError>;

    async fn set_user_password(&self, username: &str, password: &str) -> Result<(), DriverError>;

    /// Usernames defined in the admin database
    async fn get_users(&self) -> Result<BTreeSet<String>, DriverError>;
}

/// Driver running `mongosh` in the workload container
pub struct MongoshDriver {
    workload: Arc<dyn Workload>,
    mongosh_path: String,
}

impl MongoshDriver {
    pub fn new(workload: Arc<dyn Workload>) -> Self {
        Self {
            workload,
            mongosh_path: MONGOSH_PATH.to_string(),
        }
    }
}

impl ClusterDriver for MongoshDriver {
    fn connect(
        &self,
        config: &MongoConfiguration,
        host: Option<&str>,
        direct: bool,
    ) -> Box<dyn ClusterConnection> {
        let (uri, target) = match (host, direct) {
            (Some(h), true) => (config.direct_uri(h), Some(h.to_string())),
            (Some(h), false) => {
                let mut single = config.clone();
                single.hosts = BTreeSet::from([h.to_string()]);
                (single.uri(), Some(h.to_string()))
            }
            (None, _) => (config.uri(), None),
        };
        Box::new(MongoshConnection {
            workload: self.workload.clone(),
            mongosh_path: self.mongosh_path.clone(),
            uri,
            target,
            replset: config.replset.clone(),
        })
    }
}

struct MongoshConnection {
    workload: Arc<dyn Workload>,
    mongosh_path: String,
    uri: String,
    target: Option<String>,
    replset: String,
}

#[derive(Deserialize)]
struct MemberStatus {
    name: String,
    #[serde(rename = "stateStr")]
    state: String,
}

#[derive(Deserialize)]
struct ReplSetStatus {
    members: Vec<MemberStatus>,
}

#[derive(Deserialize)]
struct ReplSetMember {
    host: String,
}

#[derive(Deserialize)]
struct ReplSetConfig {
    members: Vec<ReplSetMember>,
}

impl MongoshConnection {
    /// Evaluate a JS expression and parse its EJSON result
    async fn eval(&self, expression: &str) -> Result<Value, DriverError> {
        self.eval_with_password(expression, None).await
    }

    /// Evaluate with `password` readable as `process.env.MONGOSH_PASSWORD`
    ///
    /// The connection string and the password reach mongosh through its
    /// environment; the command line carries neither.
    async fn eval_with_password(
        &self,
        expression: &str,
        password: Option<&str>,
    ) -> Result<Value, DriverError> {
        let command = mongosh_command(&self.mongosh_path, expression);
        let mut env = BTreeMap::from([(URI_ENV.to_string(), self.uri.clone())]);
        if let Some(password) = password {
            env.insert(PASSWORD_ENV.to_string(), password.to_string());
        }
        let stdout = self.workload.exec(&command, &env, None).await?;
        let line = stdout
            .lines()
            .rev()
            .find(|l| !l.trim().is_empty())
            .unwrap_or("null");
        Ok(serde_json::from_str(line)?)
    }

    async fn ensure_no_member_syncing(&self) -> Result<(), DriverError> {
        let states = self.get_member_states().await?;
        if let Some((host, state)) = states
            .iter()
            .find(|(_, state)| SYNCING_STATES.contains(&state.as_str()))
        {
            return Err(DriverError::NotReady(format!("{} is {}", host, state)));
        }
        Ok(())
    }

    fn js_string(value: &str) -> String {
        // JSON string literals are valid JS string literals
        Value::String(value.to_string()).to_string()
    }
}

#[async_trait]
impl ClusterConnection for MongoshConnection {
    async fn is_ready(&self) -> bool {
        match self.eval("db.adminCommand({ping: 1})").await {
            Ok(reply) => reply.get("ok").and_then(Value::as_f64) == Some(1.0),
            Err(e) => {
                debug!(target_host = ?self.target, error = %e, "Ping failed");
                false
            }
        }
    }

    async fn get_members(&self) -> Result<BTreeSet<String>, DriverError> {
        let reply = self.eval("rs.conf()").await?;
        let config: ReplSetConfig = serde_json::from_value(reply)?;
        Ok(config
            .members
            .iter()
            .map(|m| member_hostname(&m.host).to_string())
            .collect())
    }

    async fn get_member_states(&self) -> Result<BTreeMap<String, String>, DriverError> {
        let reply = self.eval("rs.status()").await?;
        let status: ReplSetStatus = serde_json::from_value(reply)?;
        Ok(status
            .members
            .into_iter()
            .map(|m| (member_hostname(&m.name).to_string(), m.state))
            .collect())
    }

    async fn add_member(&self, host: &str) -> Result<(), DriverError> {
        self.ensure_no_member_syncing().await?;
        let member = Self::js_string(&format!("{}:{}", host, MONGODB_PORT));
        self.eval(&format!("rs.add({{host: {}}})", member)).await?;
        Ok(())
    }

    async fn remove_member(&self, host: &str) -> Result<(), DriverError> {
        self.ensure_no_member_syncing().await?;
        let member = Self::js_string(&format!("{}:{}", host, MONGODB_PORT));
        self.eval(&format!("rs.remove({})", member)).await?;
        Ok(())
    }

    async fn init_replset(&self) -> Result<(), DriverError> {
        let host = self.target.as_deref().unwrap_or("localhost");
        let config = json!({
            "_id": self.replset,
            "members": [{"_id": 0, "host": format!("{}:{}", host, MONGODB_PORT)}],
        });
        match self.eval(&format!("rs.initiate({})", config)).await {
            Ok(_) => Ok(()),
            Err(DriverError::Command(msg)) if msg.contains(ALREADY_INITIALIZED) => {
                debug!("Replica set already initialised");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn create_user(&self, config: &MongoConfiguration) -> Result<(), DriverError> {
        let roles: Vec<Value> = config
            .roles
            .iter()
            .map(|r| json!({"role": r, "db": config.database}))
            .collect();
        let doc = json!({
            "user": config.username,
            "roles": roles,
            "mechanisms": ["SCRAM-SHA-256"],
        });
        self.eval_with_password(
            &format!(
                "db.getSiblingDB({}).createUser(Object.assign({}, {{pwd: process.env.{}}}))",
                Self::js_string(&config.database),
                doc,
                PASSWORD_ENV
            ),
            Some(&config.password),
        )
        .await?;
        Ok(())
    }

    async fn create_role(&self, role: &str, privileges: &Value) -> Result<(), DriverError> {
        let doc = json!({"role": role, "privileges": privileges, "roles": []});
        match self
            .eval(&format!("db.getSiblingDB('admin').createRole({})", doc))
            .await
        {
            Ok(_) => Ok(()),
            // A retried user creation finds its role in place
            Err(DriverError::Command(msg)) if msg.contains("already exists") => {
                debug!(role = %role, "Role already exists");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn set_user_password(&self, username: &str, password: &str) -> Result<(), DriverError> {
        self.ensure_no_member_syncing().await?;
        self.eval_with_password(
            &format!(
                "db.getSiblingDB('admin').updateUser({}, {{pwd: process.env.{}}})",
                Self::js_string(username),
                PASSWORD_ENV
            ),
            Some(password),
        )
        .await?;
        Ok(())
    }

    async fn get_users(&self) -> Result<BTreeSet<String>, DriverError> {
        let reply = self
            .eval("db.getSiblingDB('admin').getUsers().users.map(u => u.user)")
            .await?;
        let users: Vec<String> = serde_json::from_value(reply)?;
        Ok(users.into_iter().collect())
    }
}
