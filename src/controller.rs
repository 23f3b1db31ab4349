//! Activation controller
//!
//! Owns the shared state of the whole system: the activity registry, the
//! per-service start locks, the manifest resolver, and the container runtime
//! handle. One `Controller` is constructed at startup and shared (as an
//! `Arc`) between the HTTP handler and the reaper task.

use crate::activity::ActivityRegistry;
use crate::config::Config;
use crate::docker::{ContainerRuntime, ContainerSnapshot};
use crate::error::ActivationError;
use crate::manifest::ManifestResolver;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex as StartLock;
use tracing::{debug, info};

/// Hard ceiling on how long a cold start may take to open its port.
pub const READINESS_TIMEOUT: Duration = Duration::from_secs(20);
const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(1);
const PORT_PROBE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lazily allocated per-service mutexes serializing activation.
///
/// The outer mutex only guards the lookup-or-insert; it is never held across
/// I/O. Per-service locks live for the rest of the process.
#[derive(Default)]
pub struct StartLockTable {
    locks: Mutex<HashMap<String, Arc<StartLock<()>>>>,
}

impl StartLockTable {
    pub fn acquire(&self, service: &str) -> Arc<StartLock<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(locks.entry(service.to_string()).or_default())
    }
}

pub struct Controller {
    config: Config,
    runtime: Arc<dyn ContainerRuntime>,
    resolver: ManifestResolver,
    registry: ActivityRegistry,
    start_locks: StartLockTable,
}

impl Controller {
    /// Returns `Arc<Self>` because the controller is shared between the
    /// request handlers and the reaper task.
    pub fn new(config: Config, runtime: Arc<dyn ContainerRuntime>) -> Arc<Self> {
        let resolver = ManifestResolver::new(config.demos_dir.clone());
        Arc::new(Self {
            config,
            runtime,
            resolver,
            registry: ActivityRegistry::new(),
            start_locks: StartLockTable::default(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &ActivityRegistry {
        &self.registry
    }

    pub fn runtime(&self) -> &dyn ContainerRuntime {
        self.runtime.as_ref()
    }

    /// Ensure the service has a running container whose port accepts
    /// connections.
    ///
    /// Fast path: an already running container returns immediately, without
    /// taking the start lock. Otherwise activation is serialized per service;
    /// losers of the race observe the started container under the lock and
    /// return without invoking the CLI again.
    pub async fn ensure_running(&self, service: &str, port: u16) -> Result<(), ActivationError> {
        if self.find_running(service).await?.is_some() {
            return Ok(());
        }

        let lock = self.start_locks.acquire(service);
        let _serialized = lock.lock().await;

        // Another request may have finished the start while we waited.
        if self.find_running(service).await?.is_some() {
            return Ok(());
        }

        info!(service, "starting service");

        let dir = self
            .resolver
            .resolve(service)
            .await
            .map_err(ActivationError::Resolve)?;

        let env_file = dir.join(".env");
        let env_file = match tokio::fs::metadata(&env_file).await {
            Ok(_) => Some(env_file),
            Err(_) => {
                debug!(service, path = %env_file.display(), "optional .env file not found, starting without it");
                None
            }
        };

        self.runtime
            .compose_up(service, env_file.as_deref())
            .await
            .map_err(|source| ActivationError::StartFailed {
                service: service.to_string(),
                source,
            })?;

        self.await_ready(service, port).await
    }

    async fn find_running(
        &self,
        service: &str,
    ) -> Result<Option<ContainerSnapshot>, ActivationError> {
        let container = self
            .runtime
            .find_by_service(&self.config.project_name, service)
            .await
            .map_err(ActivationError::Runtime)?;
        Ok(container.filter(ContainerSnapshot::is_running))
    }

    /// Poll container state and the service's TCP port until both are good,
    /// or the readiness budget runs out.
    ///
    /// The probe targets the service DNS name; the compose network is
    /// expected to resolve it. Runtime query errors during the poll are
    /// retried, not surfaced, since the budget bounds the whole wait.
    async fn await_ready(&self, service: &str, port: u16) -> Result<(), ActivationError> {
        let poll = async {
            loop {
                if let Ok(Some(_)) = self.find_running(service).await {
                    if self
                        .runtime
                        .is_port_open(service, port, PORT_PROBE_TIMEOUT)
                        .await
                    {
                        return;
                    }
                }
                tokio::time::sleep(READINESS_POLL_INTERVAL).await;
            }
        };

        match tokio::time::timeout(READINESS_TIMEOUT, poll).await {
            Ok(()) => {
                info!(service, port, "service is ready");
                Ok(())
            }
            Err(_) => Err(ActivationError::NotReady {
                service: service.to_string(),
                port,
                waited: READINESS_TIMEOUT,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_service_gets_same_lock() {
        let table = StartLockTable::default();
        let first = table.acquire("alpha");
        let second = table.acquire("alpha");
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_distinct_services_get_distinct_locks() {
        let table = StartLockTable::default();
        let alpha = table.acquire("alpha");
        let beta = table.acquire("beta");
        assert!(!Arc::ptr_eq(&alpha, &beta));
    }

    #[tokio::test]
    async fn test_lock_serializes_holders() {
        let table = StartLockTable::default();
        let lock = table.acquire("alpha");

        let guard = lock.lock().await;
        let contender = table.acquire("alpha");
        assert!(contender.try_lock().is_err());
        drop(guard);
        assert!(contender.try_lock().is_ok());
    }
}
