use lobbygate::checkpoint::Checkpointing;
use lobbygate::config::Config;
use lobbygate::lifecycle::BackendLifecycle;
use lobbygate::process::{ProcessLauncher, SystemLauncher};
use lobbygate::server::ProxyServer;
use lobbygate::{PKG_NAME, VERSION};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lobbygate=debug".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    // Write PID file if configured (with exclusive lock on Unix)
    let pid_file_path = config.proxy.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let launcher: Arc<dyn ProcessLauncher> = Arc::new(SystemLauncher);
    let checkpointing = Checkpointing::from_config(&config.checkpoint, Arc::clone(&launcher));
    let lifecycle = BackendLifecycle::new(config.backend.clone(), launcher, checkpointing)?;

    let bind_addr: SocketAddr = format!("{}:{}", config.proxy.bind, config.proxy.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.proxy.bind, port = config.proxy.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let context = ProxyServer::context(&config, Arc::clone(&lifecycle))?;
    let server = ProxyServer::new(bind_addr, context, shutdown_rx);
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Proxy server error");
        }
    });

    wait_for_signal().await?;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    info!("Stopping backend...");
    lifecycle.unqueue_shutdown();
    let outcome = lifecycle.stop().await;
    info!(?outcome, "Backend stop requested");

    let limit = config.backend.shutdown_grace_period() + Duration::from_secs(5);
    if !lifecycle.wait_for_exit(limit).await {
        warn!(limit_secs = limit.as_secs(), "Backend still running at shutdown");
    }

    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    // Clean up PID file
    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let result = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another proxy instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        writeln!(&file, "{}", std::process::id())?;
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::io::Write;
        let mut file = std::fs::File::create(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting proxy server");
    info!(
        bind = %config.proxy.bind,
        port = config.proxy.port,
        max_players = config.proxy.max_players,
        whitelist = config.proxy.whitelist.as_ref().map(|w| w.len()),
        holding_world = ?config.proxy.holding_world_dir,
        "Proxy configuration"
    );
    info!(
        address = %config.backend.socket_address(),
        executable = %config.backend.executable,
        args = ?config.backend.args,
        working_dir = ?config.backend.working_dir,
        log_file = ?config.backend.log_file,
        "Backend configuration"
    );
    info!(
        idle_shutdown_secs = config.backend.idle_shutdown_secs,
        shutdown_grace_period_secs = config.backend.shutdown_grace_period_secs,
        warmup_ms = config.backend.warmup_ms,
        "Lifecycle settings"
    );
    info!(
        enabled = config.checkpoint.enabled,
        criu = %config.checkpoint.criu_path,
        images_dir = %config.checkpoint.images_dir,
        "Checkpoint settings"
    );
}
