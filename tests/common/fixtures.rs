//! In-memory collaborators and a handler context built from them
//!
//! Every external seam of the operator (workload container, cluster driver,
//! peer data, secret backend, inventory, connection consumers, status sink
//! and clock) has a fake here that records what it was asked to do.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! let h = TestHarness::new(&[1, 2]).await;   // unit 0 with peers 1 and 2
//! h.set_leader(true);
//! h.set_initialised().await;
//! reconcile(&h.ctx, &Trigger::PeerChanged).await?;
//! assert_eq!(h.driver.calls(), vec!["add:mongodb-1.mongodb-endpoints", ...]);
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use mongodb_operator::OperatorConfig;
use mongodb_operator::backup::SyncPolicies;
use mongodb_operator::config::backup::PBM_PATH;
use mongodb_operator::config::{DB_INITIALISED_KEY, FLAG_TRUE, SOCKET_PATH};
use mongodb_operator::controller::status::UnitStatus;
use mongodb_operator::controller::users::{BACKUP, MONITOR, OPERATOR};
use mongodb_operator::controller::{Collaborators, Context, Sleeper, UnitId};
use mongodb_operator::resources::connections::ConnectionPublisher;
use mongodb_operator::resources::inventory::{Inventory, peer_units_for};
use mongodb_operator::resources::secret::SecretContent;
use mongodb_operator::resources::status_reporter::StatusReporter;
use mongodb_operator::resources::{
    ClusterConnection, ClusterDriver, DriverError, FileOwner, MongoConfiguration, PeerStore,
    PeerStoreError, Scope, SecretBackend, SecretError, SecretStore, Workload, WorkloadError,
};

pub const APP: &str = "mongodb";

/// Replica set hostname of unit `ordinal`
pub fn host(ordinal: u32) -> String {
    format!("{app}-{n}.{app}-endpoints", app = APP, n = ordinal)
}

pub fn unit(ordinal: u32) -> UnitId {
    UnitId::new(APP, ordinal).unwrap()
}

pub fn hosts(ordinals: &[u32]) -> BTreeSet<String> {
    ordinals.iter().map(|n| host(*n)).collect()
}

// =============================================================================
// pbm status payloads
// =============================================================================

pub const PBM_IDLE: &str = "{}";
pub const PBM_RESYNCING: &str = r#"{"running": {"type": "resync", "name": ""}}"#;
pub const PBM_BACKUP_RUNNING: &str =
    r#"{"running": {"type": "backup", "name": "2024-05-01T10:00:00Z"}}"#;
pub const PBM_FORBIDDEN: &str = "Error: get backup list: status code: 403, request id: x";

/// Scripted answer to `pbm status`
#[derive(Clone, Debug)]
pub enum PbmReply {
    Output(String),
    /// pbm exits nonzero and prints the error on stdout
    Failed(String),
}

impl PbmReply {
    pub fn output(s: &str) -> Self {
        PbmReply::Output(s.to_string())
    }

    pub fn failed(s: &str) -> Self {
        PbmReply::Failed(s.to_string())
    }

    fn into_result(self) -> Result<String, WorkloadError> {
        match self {
            PbmReply::Output(out) => Ok(out),
            PbmReply::Failed(stdout) => Err(WorkloadError::Exec {
                exit_code: 1,
                stdout,
                stderr: String::new(),
            }),
        }
    }
}

// =============================================================================
// Workload
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PushedFile {
    pub path: String,
    pub content: String,
    pub permissions: u32,
    pub owner: Option<FileOwner>,
}

#[derive(Debug)]
struct WorkloadState {
    can_connect: bool,
    service_defined: bool,
    existing: BTreeSet<String>,
    statuses: VecDeque<PbmReply>,
    default_status: PbmReply,
    failing_options: BTreeSet<String>,
    commands: Vec<Vec<String>>,
    stdin: Vec<Option<String>>,
    pushed: Vec<PushedFile>,
    service_queries: u32,
    starts: u32,
    restarts: u32,
}

/// Workload container answering pbm and mongosh calls from a script
pub struct FakeWorkload {
    state: Mutex<WorkloadState>,
}

impl Default for FakeWorkload {
    fn default() -> Self {
        Self {
            state: Mutex::new(WorkloadState {
                can_connect: true,
                service_defined: true,
                existing: BTreeSet::from([SOCKET_PATH.to_string()]),
                statuses: VecDeque::new(),
                default_status: PbmReply::output(PBM_IDLE),
                failing_options: BTreeSet::new(),
                commands: Vec::new(),
                stdin: Vec::new(),
                pushed: Vec::new(),
                service_queries: 0,
                starts: 0,
                restarts: 0,
            }),
        }
    }
}

impl FakeWorkload {
    /// Answer every `pbm status` not otherwise scripted
    pub fn set_default_status(&self, reply: PbmReply) {
        self.state.lock().unwrap().default_status = reply;
    }

    /// Answer the next `pbm status` calls in order
    pub fn script_statuses(&self, replies: impl IntoIterator<Item = PbmReply>) {
        self.state.lock().unwrap().statuses.extend(replies);
    }

    pub fn set_service_defined(&self, defined: bool) {
        self.state.lock().unwrap().service_defined = defined;
    }

    pub fn set_can_connect(&self, up: bool) {
        self.state.lock().unwrap().can_connect = up;
    }

    /// Make `pbm config --set <key>=...` (or `--file <key>`) fail
    pub fn fail_option(&self, key: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_options
            .insert(key.to_string());
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.state.lock().unwrap().commands.clone()
    }

    /// Argument lists of every pbm invocation
    pub fn pbm_calls(&self) -> Vec<Vec<String>> {
        self.commands()
            .into_iter()
            .filter(|c| c.first().map(String::as_str) == Some(PBM_PATH))
            .map(|c| c[1..].to_vec())
            .collect()
    }

    /// `pbm config --set` assignments in order
    pub fn option_assignments(&self) -> Vec<String> {
        self.pbm_calls()
            .into_iter()
            .filter(|args| args.len() == 3 && args[0] == "config" && args[1] == "--set")
            .map(|args| args[2].clone())
            .collect()
    }

    pub fn stdin(&self) -> Vec<Option<String>> {
        self.state.lock().unwrap().stdin.clone()
    }

    pub fn pushed(&self) -> Vec<PushedFile> {
        self.state.lock().unwrap().pushed.clone()
    }

    pub fn service_queries(&self) -> u32 {
        self.state.lock().unwrap().service_queries
    }

    pub fn restarts(&self) -> u32 {
        self.state.lock().unwrap().restarts
    }

    pub fn starts(&self) -> u32 {
        self.state.lock().unwrap().starts
    }

    fn run_pbm(state: &mut WorkloadState, args: &[String]) -> Result<String, WorkloadError> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["status", "-o", "json"] => state
                .statuses
                .pop_front()
                .unwrap_or_else(|| state.default_status.clone())
                .into_result(),
            ["config", "--set", assignment] => {
                let key = assignment.split_once('=').map(|(k, _)| k).unwrap_or_default();
                if state.failing_options.contains(key) {
                    PbmReply::failed("Error: unknown option").into_result()
                } else {
                    Ok(String::new())
                }
            }
            ["config", "--file", path] if state.failing_options.contains(*path) => {
                PbmReply::failed("Error: unable to read config file").into_result()
            }
            ["backup"] => Ok("Starting backup '2024-05-01T10:00:00Z'".to_string()),
            _ => Ok(String::new()),
        }
    }
}

#[async_trait]
impl Workload for FakeWorkload {
    async fn exec(
        &self,
        command: &[String],
        _env: &BTreeMap<String, String>,
        stdin: Option<&str>,
    ) -> Result<String, WorkloadError> {
        let mut state = self.state.lock().unwrap();
        state.commands.push(command.to_vec());
        state.stdin.push(stdin.map(str::to_string));
        if command.first().map(String::as_str) == Some(PBM_PATH) {
            return Self::run_pbm(&mut state, &command[1..]);
        }
        Ok(String::new())
    }

    async fn can_connect(&self) -> bool {
        self.state.lock().unwrap().can_connect
    }

    async fn push(
        &self,
        path: &str,
        content: &str,
        permissions: u32,
        owner: Option<&FileOwner>,
    ) -> Result<(), WorkloadError> {
        let mut state = self.state.lock().unwrap();
        state.existing.insert(path.to_string());
        state.pushed.push(PushedFile {
            path: path.to_string(),
            content: content.to_string(),
            permissions,
            owner: owner.cloned(),
        });
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool, WorkloadError> {
        Ok(self.state.lock().unwrap().existing.contains(path))
    }

    async fn service_exists(&self, _service: &str) -> Result<bool, WorkloadError> {
        let mut state = self.state.lock().unwrap();
        state.service_queries += 1;
        Ok(state.service_defined)
    }

    async fn start_service(&self, _service: &str) -> Result<(), WorkloadError> {
        self.state.lock().unwrap().starts += 1;
        Ok(())
    }

    async fn restart_service(&self, _service: &str) -> Result<(), WorkloadError> {
        self.state.lock().unwrap().restarts += 1;
        Ok(())
    }
}

// =============================================================================
// Cluster driver
// =============================================================================

#[derive(Debug, Default)]
struct ClusterState {
    live: BTreeSet<String>,
    ready: BTreeSet<String>,
    member_states: BTreeMap<String, String>,
    users: BTreeSet<String>,
    passwords: BTreeMap<String, String>,
    unreachable: bool,
    syncing: bool,
    calls: Vec<String>,
}

/// Replica set held in memory
///
/// Mutating calls are logged as `<op>:<target>` in the order they were made.
#[derive(Clone, Default)]
pub struct FakeDriver {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeDriver {
    pub fn set_live(&self, members: BTreeSet<String>) {
        self.state.lock().unwrap().live = members;
    }

    pub fn live(&self) -> BTreeSet<String> {
        self.state.lock().unwrap().live.clone()
    }

    /// Hosts (or `localhost`) answering direct connections
    pub fn set_ready(&self, hosts: impl IntoIterator<Item = String>) {
        self.state.lock().unwrap().ready = hosts.into_iter().collect();
    }

    pub fn set_member_state(&self, host: &str, state: &str) {
        self.state
            .lock()
            .unwrap()
            .member_states
            .insert(host.to_string(), state.to_string());
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unwrap().unreachable = unreachable;
    }

    /// Members report catching up; membership and password changes refuse
    pub fn set_syncing(&self, syncing: bool) {
        self.state.lock().unwrap().syncing = syncing;
    }

    pub fn add_user(&self, username: &str) {
        self.state.lock().unwrap().users.insert(username.to_string());
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn password(&self, username: &str) -> Option<String> {
        self.state.lock().unwrap().passwords.get(username).cloned()
    }
}

impl ClusterDriver for FakeDriver {
    fn connect(
        &self,
        _config: &MongoConfiguration,
        host: Option<&str>,
        _direct: bool,
    ) -> Box<dyn ClusterConnection> {
        Box::new(FakeConnection {
            state: self.state.clone(),
            host: host.map(str::to_string),
        })
    }
}

struct FakeConnection {
    state: Arc<Mutex<ClusterState>>,
    host: Option<String>,
}

impl FakeConnection {
    fn reachable(&self) -> Result<std::sync::MutexGuard<'_, ClusterState>, DriverError> {
        let state = self.state.lock().unwrap();
        if state.unreachable {
            return Err(DriverError::Unreachable("connection refused".to_string()));
        }
        Ok(state)
    }

    fn settled(&self) -> Result<std::sync::MutexGuard<'_, ClusterState>, DriverError> {
        let state = self.reachable()?;
        if state.syncing {
            return Err(DriverError::NotReady("a member is syncing".to_string()));
        }
        Ok(state)
    }
}

#[async_trait]
impl ClusterConnection for FakeConnection {
    async fn is_ready(&self) -> bool {
        let state = self.state.lock().unwrap();
        match &self.host {
            Some(host) => state.ready.contains(host),
            None => !state.unreachable,
        }
    }

    async fn get_members(&self) -> Result<BTreeSet<String>, DriverError> {
        Ok(self.reachable()?.live.clone())
    }

    async fn get_member_states(&self) -> Result<BTreeMap<String, String>, DriverError> {
        Ok(self.reachable()?.member_states.clone())
    }

    async fn add_member(&self, host: &str) -> Result<(), DriverError> {
        let mut state = self.settled()?;
        state.calls.push(format!("add:{}", host));
        state.live.insert(host.to_string());
        Ok(())
    }

    async fn remove_member(&self, host: &str) -> Result<(), DriverError> {
        let mut state = self.settled()?;
        state.calls.push(format!("remove:{}", host));
        state.live.remove(host);
        Ok(())
    }

    async fn init_replset(&self) -> Result<(), DriverError> {
        let mut state = self.reachable()?;
        let target = self.host.clone().unwrap_or_default();
        state.calls.push(format!("init:{}", target));
        Ok(())
    }

    async fn create_user(&self, config: &MongoConfiguration) -> Result<(), DriverError> {
        let mut state = self.reachable()?;
        state.calls.push(format!("create_user:{}", config.username));
        state.users.insert(config.username.clone());
        Ok(())
    }

    async fn create_role(&self, role: &str, _privileges: &Value) -> Result<(), DriverError> {
        self.reachable()?.calls.push(format!("create_role:{}", role));
        Ok(())
    }

    async fn set_user_password(&self, username: &str, password: &str) -> Result<(), DriverError> {
        let mut state = self.settled()?;
        state.calls.push(format!("set_password:{}", username));
        state
            .passwords
            .insert(username.to_string(), password.to_string());
        Ok(())
    }

    async fn get_users(&self) -> Result<BTreeSet<String>, DriverError> {
        Ok(self.reachable()?.users.clone())
    }
}

// =============================================================================
// Peer data and secrets
// =============================================================================

#[derive(Default)]
pub struct MemoryPeerStore {
    data: Mutex<HashMap<(Scope, String), String>>,
}

impl MemoryPeerStore {
    pub fn value(&self, scope: Scope, key: &str) -> Option<String> {
        self.data
            .lock()
            .unwrap()
            .get(&(scope, key.to_string()))
            .cloned()
    }
}

#[async_trait]
impl PeerStore for MemoryPeerStore {
    async fn get(&self, scope: Scope, key: &str) -> Result<Option<String>, PeerStoreError> {
        Ok(self.value(scope, key))
    }

    async fn set(&self, scope: Scope, key: &str, value: &str) -> Result<(), PeerStoreError> {
        self.data
            .lock()
            .unwrap()
            .insert((scope, key.to_string()), value.to_string());
        Ok(())
    }

    async fn remove(&self, scope: Scope, key: &str) -> Result<(), PeerStoreError> {
        self.data.lock().unwrap().remove(&(scope, key.to_string()));
        Ok(())
    }
}

#[derive(Default)]
struct BackendState {
    secrets: HashMap<String, SecretContent>,
    created: u32,
    writes: u32,
}

/// Secret objects held in memory, counting every write
#[derive(Default)]
pub struct MemorySecretBackend {
    state: Mutex<BackendState>,
}

impl MemorySecretBackend {
    pub fn writes(&self) -> u32 {
        self.state.lock().unwrap().writes
    }

    pub fn content(&self, id: &str) -> Option<SecretContent> {
        self.state.lock().unwrap().secrets.get(id).cloned()
    }

    /// Change a secret behind the store's back
    pub fn overwrite(&self, id: &str, key: &str, value: &str) {
        if let Some(content) = self.state.lock().unwrap().secrets.get_mut(id) {
            content.insert(key.to_string(), value.to_string());
        }
    }
}

#[async_trait]
impl SecretBackend for MemorySecretBackend {
    async fn create(&self, scope: Scope, content: &SecretContent) -> Result<String, SecretError> {
        let mut state = self.state.lock().unwrap();
        state.created += 1;
        state.writes += 1;
        let id = format!("secret:{}{}", scope, state.created);
        state.secrets.insert(id.clone(), content.clone());
        Ok(id)
    }

    async fn get(&self, id: &str) -> Result<Option<SecretContent>, SecretError> {
        Ok(self.state.lock().unwrap().secrets.get(id).cloned())
    }

    async fn set_content(&self, id: &str, content: &SecretContent) -> Result<(), SecretError> {
        let mut state = self.state.lock().unwrap();
        state.writes += 1;
        state.secrets.insert(id.to_string(), content.clone());
        Ok(())
    }
}

// =============================================================================
// Inventory, consumers, status and clock
// =============================================================================

#[derive(Default)]
pub struct FakeInventory {
    peers: Mutex<Vec<UnitId>>,
}

impl FakeInventory {
    pub fn set_peers(&self, ordinals: &[u32]) {
        *self.peers.lock().unwrap() = ordinals.iter().map(|n| unit(*n)).collect();
    }

    /// Peers of unit 0 for a StatefulSet of `replicas` pods
    pub fn set_replicas(&self, replicas: u32) {
        *self.peers.lock().unwrap() = peer_units_for(&unit(0), replicas);
    }
}

#[async_trait]
impl Inventory for FakeInventory {
    async fn peer_units(&self) -> Result<Vec<UnitId>, kube::Error> {
        Ok(self.peers.lock().unwrap().clone())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Publication {
    pub hosts: BTreeSet<String>,
    pub users: BTreeSet<String>,
}

#[derive(Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<Publication>>,
}

impl RecordingPublisher {
    pub fn published(&self) -> Vec<Publication> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionPublisher for RecordingPublisher {
    async fn publish(
        &self,
        base: &MongoConfiguration,
        database_users: &BTreeSet<String>,
    ) -> Result<(), kube::Error> {
        self.published.lock().unwrap().push(Publication {
            hosts: base.hosts.clone(),
            users: database_users.clone(),
        });
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingReporter {
    reported: Mutex<Vec<UnitStatus>>,
}

impl RecordingReporter {
    pub fn reported(&self) -> Vec<UnitStatus> {
        self.reported.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<UnitStatus> {
        self.reported.lock().unwrap().last().cloned()
    }
}

#[async_trait]
impl StatusReporter for RecordingReporter {
    async fn report(&self, status: &UnitStatus) {
        self.reported.lock().unwrap().push(status.clone());
    }

    async fn current(&self) -> Option<UnitStatus> {
        self.last()
    }
}

/// Clock that returns immediately and remembers every requested delay
#[derive(Default)]
pub struct RecordingSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sleeper for RecordingSleeper {
    async fn sleep(&self, duration: Duration) {
        self.slept.lock().unwrap().push(duration);
    }
}

// =============================================================================
// Harness
// =============================================================================

pub const OPERATOR_PASSWORD: &str = "operator-secret";
pub const BACKUP_PASSWORD: &str = "backup-secret";
pub const MONITOR_PASSWORD: &str = "monitor-secret";

/// Handler context for unit 0 wired to fakes
pub struct TestHarness {
    pub workload: Arc<FakeWorkload>,
    pub driver: FakeDriver,
    pub peers: Arc<MemoryPeerStore>,
    pub backend: Arc<MemorySecretBackend>,
    pub inventory: Arc<FakeInventory>,
    pub publisher: Arc<RecordingPublisher>,
    pub reporter: Arc<RecordingReporter>,
    pub sleeper: Arc<RecordingSleeper>,
    leader: Arc<AtomicBool>,
    pub ctx: Context,
}

impl TestHarness {
    /// Unit 0 with `peers` in the inventory and internal passwords stored
    ///
    /// The live replica set holds unit 0 only, which is ready and primary.
    pub async fn new(peers: &[u32]) -> Self {
        let workload = Arc::new(FakeWorkload::default());
        let driver = FakeDriver::default();
        let peer_store = Arc::new(MemoryPeerStore::default());
        let backend = Arc::new(MemorySecretBackend::default());
        let inventory = Arc::new(FakeInventory::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let reporter = Arc::new(RecordingReporter::default());
        let sleeper = Arc::new(RecordingSleeper::default());
        let leader = Arc::new(AtomicBool::new(false));

        inventory.set_peers(peers);
        driver.set_live(hosts(&[0]));
        driver.set_ready(["localhost".to_string(), host(0)]);
        driver.set_member_state(&host(0), "PRIMARY");

        let collaborators = Collaborators {
            workload: workload.clone(),
            driver: Arc::new(driver.clone()),
            peers: peer_store.clone(),
            secrets: Arc::new(SecretStore::new(backend.clone(), peer_store.clone())),
            inventory: inventory.clone(),
            publisher: publisher.clone(),
            reporter: reporter.clone(),
            sleeper: sleeper.clone(),
        };
        let ctx = Context::new(
            OperatorConfig::new(APP, format!("{}-0", APP)),
            unit(0),
            collaborators,
            leader.clone(),
        );

        for (user, password) in [
            (&OPERATOR, OPERATOR_PASSWORD),
            (&BACKUP, BACKUP_PASSWORD),
            (&MONITOR, MONITOR_PASSWORD),
        ] {
            ctx.secrets
                .set(Scope::App, &user.password_key(), password)
                .await
                .unwrap();
        }
        ctx.secrets.invalidate().await;

        Self {
            workload,
            driver,
            peers: peer_store,
            backend,
            inventory,
            publisher,
            reporter,
            sleeper,
            leader,
            ctx,
        }
    }

    pub fn with_sync_policies(mut self, policies: SyncPolicies) -> Self {
        self.ctx = self.ctx.with_sync_policies(policies);
        self
    }

    pub fn set_leader(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }

    pub async fn set_initialised(&self) {
        self.peers
            .set(Scope::App, DB_INITIALISED_KEY, FLAG_TRUE)
            .await
            .unwrap();
    }

    /// Establish the S3 credentials relation without configuring pbm
    pub async fn relate_s3(&self) {
        self.ctx.set_s3_credentials(Some(s3_credentials())).await;
    }
}

pub fn s3_credentials() -> mongodb_operator::backup::S3Credentials {
    [
        ("bucket", "backups"),
        ("region", "eu-west-1"),
        ("access-key", "AKIA"),
        ("secret-key", "s3cr3t"),
    ]
    .into_iter()
    .collect()
}
