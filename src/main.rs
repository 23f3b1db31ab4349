use anyhow::Context;
use lazygate::config::Config;
use lazygate::controller::Controller;
use lazygate::docker::DockerRuntime;
use lazygate::proxy::ProxyServer;
use lazygate::reaper;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Port the proxy front-end listens on.
const LISTEN_PORT: u16 = 8001;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lazygate=debug".parse().expect("valid log directive")),
        )
        .init();

    let config = Config::from_env();
    print_startup_banner(&config);

    let pid_file_path = config.pid_file.clone();
    let _pid_lock = match pid_file_path.as_deref() {
        Some(path) => {
            let lock = lock_pid_file(path)?;
            info!(path = %path.display(), "PID file locked");
            Some(lock)
        }
        None => None,
    };

    let runtime = DockerRuntime::new(&config).await.map_err(|e| {
        error!(error = %e, "failed to connect to the container runtime");
        e
    })?;

    let controller = Controller::new(config, Arc::new(runtime));

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Spawn the idle reaper
    let reaper_handle = tokio::spawn(reaper::run(Arc::clone(&controller), shutdown_rx.clone()));

    // Spawn the proxy front-end
    let bind_addr = SocketAddr::from(([0, 0, 0, 0], LISTEN_PORT));
    let proxy = ProxyServer::new(bind_addr, Arc::clone(&controller), shutdown_rx.clone());
    let proxy_handle = tokio::spawn(async move {
        if let Err(e) = proxy.run().await {
            error!(error = %e, "proxy server error");
        }
    });

    wait_for_shutdown_signal().await;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for tasks to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = proxy_handle.await;
        let _ = reaper_handle.await;
    })
    .await;

    // Clean up PID file
    if let Some(path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(&path) {
            warn!(path = %path.display(), error = %e, "failed to remove PID file");
        }
    }

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to listen for Ctrl+C");
        info!("received Ctrl+C, shutting down...");
    }
}

fn print_startup_banner(config: &Config) {
    info!(
        name = env!("CARGO_PKG_NAME"),
        version = env!("CARGO_PKG_VERSION"),
        "starting lazy activation proxy"
    );
    info!(
        project = %config.project_name,
        demos_dir = %config.demos_dir.display(),
        idle_timeout_secs = config.idle_timeout.as_secs(),
        listen_port = LISTEN_PORT,
        "effective configuration"
    );
}

/// Keeps the PID file's exclusive lock alive; dropping the handle (process
/// exit) releases it.
struct PidLock {
    _file: std::fs::File,
}

/// Record our PID in `path` and take an exclusive lock on it, so two
/// controllers pointed at the same fleet refuse to run side by side.
/// On non-Unix platforms the file is written without a lock.
fn lock_pid_file(path: &Path) -> anyhow::Result<PidLock> {
    use std::io::Write;

    let file = std::fs::File::create(path)
        .with_context(|| format!("cannot create PID file {}", path.display()))?;

    #[cfg(unix)]
    {
        use std::os::unix::io::AsRawFd;

        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            let err = std::io::Error::last_os_error();
            return Err(match err.kind() {
                std::io::ErrorKind::WouldBlock => anyhow::anyhow!(
                    "PID file {} is held by a running instance",
                    path.display()
                ),
                _ => anyhow::Error::from(err)
                    .context(format!("flock on PID file {} failed", path.display())),
            });
        }
    }

    writeln!(&file, "{}", std::process::id())?;
    Ok(PidLock { _file: file })
}
