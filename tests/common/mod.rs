//! Shared test fixtures: a deterministic fake container runtime and a
//! compose manifest tree builder.

#![allow(dead_code)]

use async_trait::async_trait;
use lazygate::config::Config;
use lazygate::controller::Controller;
use lazygate::docker::{ContainerRuntime, ContainerSnapshot, PROJECT_LABEL, SERVICE_LABEL};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub const TEST_PROJECT: &str = "demos";

/// In-memory container runtime with deterministic state transitions.
///
/// Containers are keyed by service name. `compose_up` counts invocations
/// (the thundering-herd scenarios depend on that) and, unless configured
/// otherwise, transitions the service's container to running and opens its
/// port.
pub struct FakeRuntime {
    containers: Mutex<HashMap<String, ContainerSnapshot>>,
    open_ports: Mutex<HashSet<String>>,
    compose_invocations: AtomicUsize,
    start_delay: Duration,
    fail_compose: AtomicBool,
    starts_stay_down: AtomicBool,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Self::with_start_delay(Duration::ZERO)
    }

    pub fn with_start_delay(start_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            containers: Mutex::new(HashMap::new()),
            open_ports: Mutex::new(HashSet::new()),
            compose_invocations: AtomicUsize::new(0),
            start_delay,
            fail_compose: AtomicBool::new(false),
            starts_stay_down: AtomicBool::new(false),
        })
    }

    /// Register a container for `service` in the given state, with the
    /// standard compose labels plus `extra_labels`.
    pub fn insert(&self, service: &str, state: &str, extra_labels: &[(&str, &str)]) {
        let mut labels: HashMap<String, String> = extra_labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        labels.insert(SERVICE_LABEL.to_string(), service.to_string());
        labels.insert(PROJECT_LABEL.to_string(), TEST_PROJECT.to_string());

        self.containers.lock().insert(
            service.to_string(),
            ContainerSnapshot {
                id: format!("{}-0001", service),
                state: state.to_string(),
                labels,
            },
        );
    }

    pub fn set_port_open(&self, service: &str, open: bool) {
        let mut ports = self.open_ports.lock();
        if open {
            ports.insert(service.to_string());
        } else {
            ports.remove(service);
        }
    }

    /// Make every `compose_up` exit non-zero.
    pub fn set_fail_compose(&self, fail: bool) {
        self.fail_compose.store(fail, Ordering::SeqCst);
    }

    /// Make `compose_up` succeed without the container ever running,
    /// simulating a backend that crash-loops on boot.
    pub fn set_starts_stay_down(&self, stay_down: bool) {
        self.starts_stay_down.store(stay_down, Ordering::SeqCst);
    }

    pub fn compose_invocations(&self) -> usize {
        self.compose_invocations.load(Ordering::SeqCst)
    }

    pub fn state_of(&self, service: &str) -> Option<String> {
        self.containers
            .lock()
            .get(service)
            .map(|container| container.state.clone())
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn find_by_service(
        &self,
        project: &str,
        service: &str,
    ) -> anyhow::Result<Option<ContainerSnapshot>> {
        let containers = self.containers.lock();
        Ok(containers
            .values()
            .find(|container| {
                container.labels.get(PROJECT_LABEL).map(String::as_str) == Some(project)
                    && container.labels.get(SERVICE_LABEL).map(String::as_str) == Some(service)
            })
            .cloned())
    }

    async fn list_all(&self) -> anyhow::Result<Vec<ContainerSnapshot>> {
        Ok(self.containers.lock().values().cloned().collect())
    }

    async fn compose_up(&self, service: &str, _env_file: Option<&Path>) -> anyhow::Result<()> {
        self.compose_invocations.fetch_add(1, Ordering::SeqCst);

        if !self.start_delay.is_zero() {
            tokio::time::sleep(self.start_delay).await;
        }
        if self.fail_compose.load(Ordering::SeqCst) {
            anyhow::bail!("docker compose exited with code 1 for service {}", service);
        }
        if self.starts_stay_down.load(Ordering::SeqCst) {
            return Ok(());
        }

        self.insert(service, "running", &[]);
        self.set_port_open(service, true);
        Ok(())
    }

    async fn stop(&self, container_id: &str, _grace: Duration) -> anyhow::Result<()> {
        let mut containers = self.containers.lock();
        let stopped = containers
            .values_mut()
            .find(|container| container.id == container_id)
            .map(|container| {
                container.state = "exited".to_string();
                container.service_name().unwrap_or_default().to_string()
            });
        drop(containers);

        match stopped {
            Some(service) => {
                self.set_port_open(&service, false);
                Ok(())
            }
            None => anyhow::bail!("no such container: {}", container_id),
        }
    }

    async fn is_port_open(&self, host: &str, _port: u16, _timeout: Duration) -> bool {
        self.open_ports.lock().contains(host)
    }
}

/// Write a root manifest plus one fragment directory per service.
pub fn write_compose_tree(services: &[&str]) -> TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut includes = String::new();
    for service in services {
        let sub = dir.path().join(service);
        std::fs::create_dir_all(&sub).expect("create service dir");
        std::fs::write(
            sub.join("docker-compose.yml"),
            format!(
                "services:\n  {}:\n    image: {}:latest\n    profiles: [\"lazy\"]\n",
                service, service
            ),
        )
        .expect("write fragment");
        includes.push_str(&format!("  - {}/docker-compose.yml\n", service));
    }
    std::fs::write(
        dir.path().join("docker-compose.yml"),
        format!("include:\n{}", includes),
    )
    .expect("write root manifest");
    dir
}

pub fn test_config(demos_dir: &Path, idle_timeout: Duration) -> Config {
    Config {
        project_name: TEST_PROJECT.to_string(),
        demos_dir: demos_dir.to_path_buf(),
        idle_timeout,
        pid_file: None,
    }
}

pub fn controller_with(
    runtime: Arc<FakeRuntime>,
    demos: &TempDir,
    idle_timeout: Duration,
) -> Arc<Controller> {
    Controller::new(test_config(demos.path(), idle_timeout), runtime)
}
