//! Idle reaper
//!
//! A single background task that periodically discovers reap-eligible
//! services and stops the ones that have been idle past the configured
//! timeout, together with their unprotected dependencies. Every failure is
//! logged and swallowed; the reaper must outlive any runtime hiccup.

use crate::controller::Controller;
use crate::docker::ContainerSnapshot;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Time between reap passes.
pub const REAP_INTERVAL: Duration = Duration::from_secs(5);
/// Grace period handed to the runtime when stopping a container.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Run reap passes until shutdown is signaled.
pub async fn run(controller: Arc<Controller>, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(REAP_INTERVAL) => {
                reap_once(&controller).await;
            }
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("reaper shutting down");
                    break;
                }
            }
        }
    }
}

/// One full pass: discover newly reap-eligible services, then stop the
/// stale ones.
pub async fn reap_once(controller: &Controller) {
    discover(controller).await;
    sweep(controller).await;
}

/// Seed the idle timer for every running container that opted into reaping.
/// Only running containers are considered; seeding stopped ones would churn
/// the registry through seed/forget cycles forever.
async fn discover(controller: &Controller) {
    let containers = match controller.runtime().list_all().await {
        Ok(containers) => containers,
        Err(e) => {
            warn!(error = %e, "could not list containers, skipping discovery");
            return;
        }
    };

    let now = Instant::now();
    for container in containers {
        if !container.is_running() || !container.reap_eligible() {
            continue;
        }
        let Some(service) = container.service_name() else {
            continue;
        };
        if controller.registry().seed(service, now) {
            info!(service, "reap-eligible service discovered, idle timer started");
        }
    }
}

async fn sweep(controller: &Controller) {
    let idle_timeout = controller.config().idle_timeout;
    let now = Instant::now();

    for (service, entry) in controller.registry().snapshot() {
        if entry.in_flight > 0 {
            continue;
        }
        if now.duration_since(entry.last_active) <= idle_timeout {
            continue;
        }
        stop_idle_service(controller, &service).await;
    }
}

/// Stop one stale service and cascade to its dependencies, then drop its
/// registry entry. The entry goes away regardless of stop success; the next
/// discovery pass re-seeds whatever is still running.
async fn stop_idle_service(controller: &Controller, service: &str) {
    let project = &controller.config().project_name;
    let container = match controller.runtime().find_by_service(project, service).await {
        Ok(container) => container,
        Err(e) => {
            warn!(service, error = %e, "container lookup failed during reap");
            None
        }
    };

    if let Some(container) = container.filter(ContainerSnapshot::is_running) {
        // The snapshot is stale by now; a request may have arrived since.
        if controller.registry().in_flight(service) > 0 {
            debug!(service, "request arrived before stop, leaving service running");
            return;
        }

        info!(service, container_id = %container.id, "idle timeout reached, stopping service");
        if let Err(e) = controller.runtime().stop(&container.id, STOP_GRACE).await {
            warn!(service, error = %e, "failed to stop container");
        }

        stop_dependencies(controller, service, &container).await;
    }

    controller.registry().forget(service);
}

/// Stop each running dependency named by the parent's `depends_on` label,
/// unless it is protected. The cascade is one level deep; dependencies of
/// dependencies are not walked.
async fn stop_dependencies(controller: &Controller, parent: &str, container: &ContainerSnapshot) {
    let project = &controller.config().project_name;

    for dependency in container.depends_on() {
        let dep_container = match controller
            .runtime()
            .find_by_service(project, &dependency)
            .await
        {
            Ok(Some(dep)) if dep.is_running() => dep,
            Ok(_) => continue,
            Err(e) => {
                warn!(parent, dependency, error = %e, "dependency lookup failed during reap");
                continue;
            }
        };

        if dep_container.protected() {
            info!(parent, dependency, "dependency is protected, leaving it running");
            continue;
        }

        info!(parent, dependency, container_id = %dep_container.id, "stopping dependency");
        if let Err(e) = controller
            .runtime()
            .stop(&dep_container.id, STOP_GRACE)
            .await
        {
            warn!(parent, dependency, error = %e, "failed to stop dependency");
        }
    }
}
