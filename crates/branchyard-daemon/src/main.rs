//! Branchyard daemon
//!
//! Runs shell commands and coding-agent sessions against git worktrees and
//! serves their live output to WebSocket viewers.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use reqwest::Method;
use tracing::{info, warn};

use branchyard_core::config;
use branchyard_daemon::agent::{AgentSessionManager, AgentSpawnConfig};
use branchyard_daemon::process::{ProcessManager, ProcessManagerConfig};
use branchyard_daemon::remote::{RemoteDelegate, RemoteRegistry};
use branchyard_daemon::server::StreamServer;
use branchyard_daemon::storage::Database;

#[derive(Parser, Debug)]
#[command(name = "branchyard-daemon")]
#[command(version, about = "Branchyard daemon - worktree process orchestration")]
struct Args {
    /// TCP bind address for the stream server
    #[arg(long, env = "BRANCHYARD_ADDR")]
    addr: Option<SocketAddr>,

    /// Database file path
    #[arg(long, env = "BRANCHYARD_DB_PATH")]
    db_path: Option<PathBuf>,

    /// Project directory whose `.branchyard/settings.json` is layered over the global config
    #[arg(long, env = "BRANCHYARD_PROJECT_DIR")]
    project_dir: Option<PathBuf>,

    /// Path to the coding-agent CLI binary
    #[arg(long, env = "BRANCHYARD_AGENT_BIN")]
    agent_bin: Option<PathBuf>,

    /// Seconds a finished process keeps its logs
    #[arg(long, env = "BRANCHYARD_RETENTION_SECS")]
    retention_secs: Option<u64>,

    /// Bearer token stream clients must present
    #[arg(long, env = "BRANCHYARD_API_KEY")]
    api_key: Option<String>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, env = "BRANCHYARD_LOG_LEVEL")]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "BRANCHYARD_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = config::load_config(args.project_dir.as_deref())?;
    if let Some(addr) = args.addr {
        config.daemon.listen_addr = addr;
    }
    if let Some(path) = args.db_path {
        config.daemon.database_path = Some(path);
    }
    if let Some(bin) = args.agent_bin {
        config.agent.program = bin;
    }
    if let Some(secs) = args.retention_secs {
        config.processes.retention_secs = secs;
    }
    if args.api_key.is_some() {
        config.daemon.api_key = args.api_key;
    }
    if let Some(level) = args.log_level {
        config.daemon.log_level = level;
    }

    branchyard_core::tracing_init::init_tracing(
        &branchyard_core::tracing_init::default_filter(&config.daemon.log_level),
        args.log_json,
    );

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %config.daemon.listen_addr,
        agent = %config.agent.program.display(),
        remote = config.remote.is_some(),
        "Starting branchyard-daemon"
    );

    let db_path = match config.daemon.database_path.clone() {
        Some(path) => path,
        None => default_db_path()?,
    };
    info!(path = %db_path.display(), "Opening database");
    let db = Database::open(&db_path).await?;

    let processes = ProcessManager::new(db.clone(), ProcessManagerConfig::from(&config.processes));
    let sessions = AgentSessionManager::new(db, AgentSpawnConfig::from(&config.agent));
    let remotes = Arc::new(RemoteRegistry::new());
    let remote = match &config.remote {
        Some(remote) => Some(RemoteDelegate::new(remote, Arc::clone(&remotes))?),
        None => None,
    };
    if let Some(remote) = remote.clone() {
        tokio::spawn(async move { check_remote(&remote).await });
    }
    let server = StreamServer::new(processes, sessions, remotes, config.daemon.api_key.clone());

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // `true` unsets $NOTIFY_SOCKET so spawned commands and agents don't notify systemd.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        result = server.serve_tcp(config.daemon.listen_addr) => {
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    info!("Daemon stopped");
    Ok(())
}

async fn check_remote(remote: &RemoteDelegate) {
    let result = remote.proxy(Method::GET, "/api/health", None).await;
    if result.ok {
        info!(url = %remote.target().url, duration_ms = result.duration_ms, "Paired remote reachable");
    } else {
        warn!(
            url = %remote.target().url,
            error_code = ?result.error_code,
            error = ?result.error,
            "Paired remote not reachable"
        );
    }
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    if let Some(path) = config::database_path() {
        return Ok(path);
    }
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".branchyard").join("daemon.db"))
}
