//! Container runtime boundary
//!
//! Everything the controller needs from the runtime is behind the
//! [`ContainerRuntime`] trait: label-filtered lookups, fleet listing,
//! compose-CLI starts, graceful stops, and TCP reachability probes. Tests
//! substitute a deterministic fake.

use crate::config::Config;
use crate::manifest::ROOT_MANIFEST;
use anyhow::Context;
use async_trait::async_trait;
use bollard::container::{ListContainersOptions, StopContainerOptions};
use bollard::models::ContainerSummary;
use bollard::Docker;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Compose label naming the service a container belongs to.
pub const SERVICE_LABEL: &str = "com.docker.compose.service";
/// Compose label naming the project a container belongs to.
pub const PROJECT_LABEL: &str = "com.docker.compose.project";
/// Compose label listing `depName[:condition]` dependency entries.
pub const DEPENDS_ON_LABEL: &str = "com.docker.compose.depends_on";
/// Marks a container as eligible for idle reaping (presence only).
pub const REAP_LABEL: &str = "remove_after_use";
/// Marks a dependency as protected from cascading stop.
pub const PROTECT_LABEL: &str = "never_remove";

/// Compose profile selecting the services this controller manages.
const COMPOSE_PROFILE: &str = "lazy";

const RUNNING_STATE: &str = "running";

/// Immutable view of one container as reported by the runtime.
#[derive(Debug, Clone)]
pub struct ContainerSnapshot {
    pub id: String,
    pub state: String,
    pub labels: HashMap<String, String>,
}

impl ContainerSnapshot {
    /// Transitional states count the same as a missing container.
    pub fn is_running(&self) -> bool {
        self.state == RUNNING_STATE
    }

    /// The compose service name, if labeled and non-empty.
    pub fn service_name(&self) -> Option<&str> {
        self.labels
            .get(SERVICE_LABEL)
            .map(String::as_str)
            .filter(|name| !name.is_empty())
    }

    pub fn reap_eligible(&self) -> bool {
        self.labels.contains_key(REAP_LABEL)
    }

    pub fn protected(&self) -> bool {
        self.labels.contains_key(PROTECT_LABEL)
    }

    /// Dependency service names parsed from the `depends_on` label.
    /// Each entry may carry a `:condition` suffix; only the name is kept.
    pub fn depends_on(&self) -> Vec<String> {
        let Some(raw) = self.labels.get(DEPENDS_ON_LABEL) else {
            return Vec::new();
        };
        raw.split(',')
            .filter_map(|entry| entry.split(':').next())
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .collect()
    }
}

impl From<ContainerSummary> for ContainerSnapshot {
    fn from(summary: ContainerSummary) -> Self {
        Self {
            id: summary.id.unwrap_or_default(),
            state: summary.state.unwrap_or_default(),
            labels: summary.labels.unwrap_or_default(),
        }
    }
}

/// Capability set the controller and reaper need from the container runtime
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Find the service's container by its two compose labels. Returns the
    /// first match; the runtime does not order multiples.
    async fn find_by_service(
        &self,
        project: &str,
        service: &str,
    ) -> anyhow::Result<Option<ContainerSnapshot>>;

    /// All containers visible to the runtime, including stopped ones.
    async fn list_all(&self) -> anyhow::Result<Vec<ContainerSnapshot>>;

    /// Bring a service up via the compose CLI. Blocks until the invocation
    /// exits; fails on a non-zero exit code.
    async fn compose_up(&self, service: &str, env_file: Option<&Path>) -> anyhow::Result<()>;

    /// Request a graceful stop with the given grace period.
    async fn stop(&self, container_id: &str, grace: Duration) -> anyhow::Result<()>;

    /// Single TCP connect attempt; the connection is closed on success.
    async fn is_port_open(&self, host: &str, port: u16, timeout: Duration) -> bool;
}

/// The real runtime: Docker Engine API for queries and stops, the
/// `docker compose` CLI for starts.
pub struct DockerRuntime {
    client: Docker,
    project: String,
    demos_dir: PathBuf,
}

impl DockerRuntime {
    /// Connect to the Docker daemon, honoring `DOCKER_HOST` when set, and
    /// verify it responds.
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let client = match std::env::var("DOCKER_HOST") {
            Ok(host) => Self::connect_to_host(&host)?,
            Err(_) => Docker::connect_with_socket_defaults().map_err(|e| {
                anyhow::anyhow!(
                    "cannot connect to the container runtime socket: {}. \
                     Ensure dockerd is running or set DOCKER_HOST.",
                    e
                )
            })?,
        };

        client
            .ping()
            .await
            .map_err(|e| anyhow::anyhow!("container runtime is not responding: {}", e))?;

        debug!("connected to container runtime");
        Ok(Self {
            client,
            project: config.project_name.clone(),
            demos_dir: config.demos_dir.clone(),
        })
    }

    fn connect_to_host(host: &str) -> anyhow::Result<Docker> {
        if host.starts_with("unix://") {
            let socket_path = host.trim_start_matches("unix://");
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("cannot connect to Unix socket '{}': {}", socket_path, e))
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION)
                .map_err(|e| anyhow::anyhow!("cannot connect to TCP endpoint '{}': {}", host, e))
        } else {
            anyhow::bail!(
                "invalid DOCKER_HOST format: '{}'. Expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn find_by_service(
        &self,
        project: &str,
        service: &str,
    ) -> anyhow::Result<Option<ContainerSnapshot>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![
                format!("{}={}", SERVICE_LABEL, service),
                format!("{}={}", PROJECT_LABEL, project),
            ],
        );
        let options = ListContainersOptions::<String> {
            all: true,
            filters,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| anyhow::anyhow!("container runtime query failed: {}", e))?;

        Ok(containers.into_iter().next().map(ContainerSnapshot::from))
    }

    async fn list_all(&self) -> anyhow::Result<Vec<ContainerSnapshot>> {
        let options = ListContainersOptions::<String> {
            all: true,
            ..Default::default()
        };

        let containers = self
            .client
            .list_containers(Some(options))
            .await
            .map_err(|e| anyhow::anyhow!("container runtime query failed: {}", e))?;

        Ok(containers.into_iter().map(ContainerSnapshot::from).collect())
    }

    async fn compose_up(&self, service: &str, env_file: Option<&Path>) -> anyhow::Result<()> {
        let mut cmd = Command::new("docker");
        cmd.arg("compose")
            .arg("-p")
            .arg(&self.project)
            .arg("--profile")
            .arg(COMPOSE_PROFILE)
            .arg("-f")
            .arg(self.demos_dir.join(ROOT_MANIFEST));
        if let Some(env_file) = env_file {
            cmd.arg("--env-file").arg(env_file);
        }
        cmd.arg("up").arg("-d").arg(service);
        cmd.current_dir(&self.demos_dir);
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        debug!(service, "running: {:?}", cmd);

        let service = service.to_string();
        // An `up` already launched must run to completion even when the
        // request that triggered it goes away; only this task awaits the
        // child, so dropping the caller cannot kill it.
        let invocation = tokio::spawn(async move {
            let mut child = cmd.spawn().context("failed to spawn docker compose")?;

            let stdout = child.stdout.take().unwrap();
            let stderr = child.stderr.take().unwrap();
            let mut stdout_reader = BufReader::new(stdout).lines();
            let mut stderr_reader = BufReader::new(stderr).lines();

            loop {
                tokio::select! {
                    line = stdout_reader.next_line() => {
                        match line {
                            Ok(Some(line)) => info!(target: "compose", service, "{}", line),
                            Ok(None) => break,
                            Err(e) => {
                                warn!(service, error = %e, "error reading compose stdout");
                                break;
                            }
                        }
                    }
                    line = stderr_reader.next_line() => {
                        match line {
                            Ok(Some(line)) => info!(target: "compose", service, "{}", line),
                            Ok(None) => {}
                            Err(e) => {
                                warn!(service, error = %e, "error reading compose stderr");
                            }
                        }
                    }
                }
            }

            let status = child.wait().await.context("failed to wait for docker compose")?;
            if status.success() {
                Ok(())
            } else {
                anyhow::bail!(
                    "docker compose exited with code {} for service {}",
                    status.code().unwrap_or(-1),
                    service
                )
            }
        });

        invocation.await.context("compose invocation task failed")?
    }

    async fn stop(&self, container_id: &str, grace: Duration) -> anyhow::Result<()> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };

        match self.client.stop_container(container_id, Some(options)).await {
            Ok(_) => {
                info!(container_id, "stopped container");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => {
                debug!(container_id, "container was already stopped");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                debug!(container_id, "container not found");
                Ok(())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to stop container {}: {}",
                container_id,
                e
            )),
        }
    }

    async fn is_port_open(&self, host: &str, port: u16, timeout: Duration) -> bool {
        match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(_connection)) => true,
            Ok(Err(_)) | Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with_labels(labels: &[(&str, &str)]) -> ContainerSnapshot {
        ContainerSnapshot {
            id: "abc123".to_string(),
            state: RUNNING_STATE.to_string(),
            labels: labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    #[test]
    fn test_is_running() {
        let mut snapshot = snapshot_with_labels(&[]);
        assert!(snapshot.is_running());

        for state in ["created", "restarting", "exited", "paused", "dead", ""] {
            snapshot.state = state.to_string();
            assert!(!snapshot.is_running(), "state {:?} must not count as running", state);
        }
    }

    #[test]
    fn test_service_name_requires_non_empty_label() {
        let snapshot = snapshot_with_labels(&[(SERVICE_LABEL, "alpha")]);
        assert_eq!(snapshot.service_name(), Some("alpha"));

        let snapshot = snapshot_with_labels(&[(SERVICE_LABEL, "")]);
        assert_eq!(snapshot.service_name(), None);

        let snapshot = snapshot_with_labels(&[]);
        assert_eq!(snapshot.service_name(), None);
    }

    #[test]
    fn test_reap_and_protect_labels_are_presence_only() {
        let snapshot = snapshot_with_labels(&[(REAP_LABEL, ""), (PROTECT_LABEL, "false")]);
        assert!(snapshot.reap_eligible());
        // The value is ignored; presence alone protects.
        assert!(snapshot.protected());

        let snapshot = snapshot_with_labels(&[]);
        assert!(!snapshot.reap_eligible());
        assert!(!snapshot.protected());
    }

    #[test]
    fn test_depends_on_parsing() {
        let snapshot =
            snapshot_with_labels(&[(DEPENDS_ON_LABEL, "db:service_started,cache, queue:healthy")]);
        assert_eq!(snapshot.depends_on(), vec!["db", "cache", "queue"]);

        let snapshot = snapshot_with_labels(&[(DEPENDS_ON_LABEL, "")]);
        assert!(snapshot.depends_on().is_empty());

        let snapshot = snapshot_with_labels(&[(DEPENDS_ON_LABEL, ",,db")]);
        assert_eq!(snapshot.depends_on(), vec!["db"]);

        let snapshot = snapshot_with_labels(&[]);
        assert!(snapshot.depends_on().is_empty());
    }

    #[test]
    fn test_snapshot_from_summary_defaults() {
        let summary = ContainerSummary {
            id: Some("deadbeef".to_string()),
            state: None,
            labels: None,
            ..Default::default()
        };
        let snapshot = ContainerSnapshot::from(summary);
        assert_eq!(snapshot.id, "deadbeef");
        assert!(!snapshot.is_running());
        assert!(snapshot.labels.is_empty());
    }
}
