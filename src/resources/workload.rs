//! Workload gateway
//!
//! The operator never runs mongod or pbm-agent itself; it talks to the
//! workload container. `Workload` is the seam, `PodWorkload` runs everything
//! through `kubectl exec`-style attach calls against the unit's pod.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{AttachParams, AttachedProcess};
use kube::{Api, Client};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

/// Errors returned by workload operations
#[derive(Error, Debug)]
pub enum WorkloadError {
    /// The command ran and exited with a nonzero code
    #[error("Command exited with code {exit_code}: {stderr}")]
    Exec {
        exit_code: i32,
        stdout: String,
        stderr: String,
    },

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Workload unavailable: {0}")]
    Unavailable(String),

    /// Environment values travel one per line and cannot span lines
    #[error("Environment variable {0} contains a newline")]
    InvalidEnv(String),
}

impl WorkloadError {
    /// Stdout of a failed command, if the command ran at all
    ///
    /// pbm reports its real error on stdout even when exiting nonzero.
    pub fn stdout(&self) -> Option<&str> {
        match self {
            WorkloadError::Exec { stdout, .. } => Some(stdout),
            _ => None,
        }
    }
}

/// Owner applied to pushed files
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileOwner {
    pub user: String,
    pub group: String,
}

impl FileOwner {
    pub fn new(user: &str, group: &str) -> Self {
        Self {
            user: user.to_string(),
            group: group.to_string(),
        }
    }
}

/// Operations the core needs from the workload container
#[async_trait]
pub trait Workload: Send + Sync {
    /// Run a command and return its stdout
    async fn exec(
        &self,
        command: &[String],
        env: &BTreeMap<String, String>,
        stdin: Option<&str>,
    ) -> Result<String, WorkloadError>;

    /// Whether the container is up and accepting exec calls
    async fn can_connect(&self) -> bool;

    /// Write a file into the container, creating parent directories
    async fn push(
        &self,
        path: &str,
        content: &str,
        permissions: u32,
        owner: Option<&FileOwner>,
    ) -> Result<(), WorkloadError>;

    async fn exists(&self, path: &str) -> Result<bool, WorkloadError>;

    /// Whether the named service is defined in the container
    async fn service_exists(&self, service: &str) -> Result<bool, WorkloadError>;

    async fn start_service(&self, service: &str) -> Result<(), WorkloadError>;

    async fn restart_service(&self, service: &str) -> Result<(), WorkloadError>;
}

/// Workload backed by exec calls into a pod container managed by pebble
pub struct PodWorkload {
    pods: Api<Pod>,
    pod_name: String,
    container: String,
}

impl PodWorkload {
    pub fn new(client: Client, namespace: &str, pod_name: &str, container: &str) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
            pod_name: pod_name.to_string(),
            container: container.to_string(),
        }
    }

    async fn run(&self, command: Vec<String>, stdin: Option<&str>) -> Result<String, WorkloadError> {
        let attach_params = AttachParams {
            container: Some(self.container.clone()),
            stdin: true,
            stdout: true,
            stderr: true,
            tty: false,
            ..Default::default()
        };

        debug!(pod = %self.pod_name, command = ?command.first(), "Executing in workload");

        let mut attached = self.pods.exec(&self.pod_name, command, &attach_params).await?;

        if let Some(mut writer) = attached.stdin() {
            if let Some(input) = stdin {
                writer.write_all(input.as_bytes()).await?;
            }
            writer.shutdown().await?;
        }

        let (stdout, stderr) = read_output(&mut attached).await?;

        let status = attached
            .take_status()
            .ok_or_else(|| WorkloadError::Unavailable("exec status channel missing".into()))?;

        if let Some(status) = status.await
            && status.status.as_deref() != Some("Success")
        {
            let exit_code = status
                .details
                .and_then(|d| d.causes)
                .and_then(|causes| {
                    causes
                        .into_iter()
                        .find(|c| c.reason.as_deref() == Some("ExitCode"))
                        .and_then(|c| c.message)
                })
                .and_then(|m| m.parse().ok())
                .unwrap_or(1);
            return Err(WorkloadError::Exec {
                exit_code,
                stdout,
                stderr,
            });
        }

        Ok(stdout)
    }

    fn pebble(action: &str, service: &str) -> Vec<String> {
        vec!["pebble".to_string(), action.to_string(), service.to_string()]
    }
}

async fn read_output(attached: &mut AttachedProcess) -> Result<(String, String), WorkloadError> {
    let mut stdout = attached
        .stdout()
        .ok_or_else(|| WorkloadError::Unavailable("exec stdout missing".into()))?;
    let mut stderr = attached
        .stderr()
        .ok_or_else(|| WorkloadError::Unavailable("exec stderr missing".into()))?;

    let mut out = Vec::new();
    let mut err = Vec::new();
    let (out_res, err_res) = tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err));
    out_res?;
    err_res?;

    Ok((
        String::from_utf8_lossy(&out).to_string(),
        String::from_utf8_lossy(&err).to_string(),
    ))
}

/// Quote a value for `sh -c`
pub fn shell_escape(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

/// Shell prologue exporting `NAME=value` lines read from stdin up to the
/// first empty line, then replacing itself with the command
const ENV_FROM_STDIN: &str =
    r#"while IFS= read -r kv && [ -n "$kv" ]; do export "$kv"; done; exec "$@""#;

/// Command line and stdin that run `command` with `env` set
///
/// exec has no environment parameter, and values placed on the command line
/// are visible to every process in the container. The assignments are sent
/// ahead of the command's own stdin instead.
pub fn with_env(
    command: &[String],
    env: &BTreeMap<String, String>,
    stdin: Option<&str>,
) -> Result<(Vec<String>, Option<String>), WorkloadError> {
    if env.is_empty() {
        return Ok((command.to_vec(), stdin.map(str::to_string)));
    }

    let mut input = String::new();
    for (name, value) in env {
        if value.contains('\n') {
            return Err(WorkloadError::InvalidEnv(name.clone()));
        }
        input.push_str(&format!("{}={}\n", name, value));
    }
    input.push('\n');
    input.push_str(stdin.unwrap_or_default());

    let mut full = vec![
        "sh".to_string(),
        "-c".to_string(),
        ENV_FROM_STDIN.to_string(),
        "sh".to_string(),
    ];
    full.extend(command.iter().cloned());
    Ok((full, Some(input)))
}

#[async_trait]
impl Workload for PodWorkload {
    async fn exec(
        &self,
        command: &[String],
        env: &BTreeMap<String, String>,
        stdin: Option<&str>,
    ) -> Result<String, WorkloadError> {
        let (full, input) = with_env(command, env, stdin)?;
        self.run(full, input.as_deref()).await
    }

    async fn can_connect(&self) -> bool {
        let pod = match self.pods.get_opt(&self.pod_name).await {
            Ok(Some(pod)) => pod,
            _ => return false,
        };
        pod.status
            .and_then(|s| s.container_statuses)
            .map(|statuses| {
                statuses
                    .iter()
                    .any(|c| c.name == self.container && c.state.as_ref().is_some_and(|st| st.running.is_some()))
            })
            .unwrap_or(false)
    }

    async fn push(
        &self,
        path: &str,
        content: &str,
        permissions: u32,
        owner: Option<&FileOwner>,
    ) -> Result<(), WorkloadError> {
        let quoted = shell_escape(path);
        let mut script = format!(
            "mkdir -p \"$(dirname {p})\" && cat > {p} && chmod {mode:o} {p}",
            p = quoted,
            mode = permissions
        );
        if let Some(owner) = owner {
            script.push_str(&format!(
                " && chown {}:{} {}",
                shell_escape(&owner.user),
                shell_escape(&owner.group),
                quoted
            ));
        }
        self.run(vec!["sh".into(), "-c".into(), script], Some(content))
            .await
            .map(|_| ())
    }

    async fn exists(&self, path: &str) -> Result<bool, WorkloadError> {
        match self
            .run(vec!["test".into(), "-e".into(), path.to_string()], None)
            .await
        {
            Ok(_) => Ok(true),
            Err(WorkloadError::Exec { exit_code: 1, .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn service_exists(&self, service: &str) -> Result<bool, WorkloadError> {
        match self.run(Self::pebble("services", service), None).await {
            Ok(out) => Ok(out.lines().skip(1).any(|l| l.split_whitespace().next() == Some(service))),
            Err(WorkloadError::Exec { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn start_service(&self, service: &str) -> Result<(), WorkloadError> {
        self.run(Self::pebble("start", service), None).await.map(|_| ())
    }

    async fn restart_service(&self, service: &str) -> Result<(), WorkloadError> {
        self.run(Self::pebble("restart", service), None).await.map(|_| ())
    }
}
