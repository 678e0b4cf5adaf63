//! Configuration resolution for Branchyard.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/branchyard/settings.json)
//! 3. Project config (.branchyard/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (applied by the daemon binary, highest priority)

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete Branchyard configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub processes: ProcessConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
}

/// Daemon-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Address the WebSocket stream server binds to.
    pub listen_addr: SocketAddr,
    pub database_path: Option<PathBuf>,
    /// Base directory under which per-branch worktrees are created.
    pub worktree_dir: Option<PathBuf>,
    pub log_level: String,
    /// Bearer token required from stream clients (and presented by paired daemons).
    pub api_key: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 47_300)),
            database_path: None,
            worktree_dir: None,
            log_level: "info".to_string(),
            api_key: None,
        }
    }
}

/// Process manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessConfig {
    /// How long a finished process keeps its log buffer for late viewers.
    pub retention_secs: u64,
    /// Grace period between SIGTERM and SIGKILL on stop. `0` disables escalation.
    pub terminate_grace_secs: u64,
    /// Shell used to interpret process commands.
    pub shell: String,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            retention_secs: 5 * 60,
            terminate_grace_secs: 5,
            shell: "sh".to_string(),
        }
    }
}

/// Coding-agent CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent executable.
    pub program: PathBuf,
    /// Arguments inserted before the stream-json flags.
    pub extra_args: Vec<String>,
    pub model: Option<String>,
    /// Seconds to wait for the agent to exit after SIGTERM before SIGKILL.
    pub terminate_timeout_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("claude"),
            extra_args: Vec::new(),
            model: None,
            terminate_timeout_secs: 5,
        }
    }
}

/// Paired remote daemon.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteConfig {
    pub url: String,
    pub api_key: String,
    #[serde(default = "default_remote_timeout_ms")]
    pub timeout_ms: u64,
}

const fn default_remote_timeout_ms() -> u64 {
    30_000
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        let global = load_config_file(&global_path)?;
        merge_config(&mut config, global);
    }

    if let Some(dir) = project_dir {
        let project_path = dir.join(".branchyard").join("settings.json");
        if project_path.exists() {
            let project = load_config_file(&project_path)?;
            merge_config(&mut config, project);
        }
    }

    apply_env_overrides(&mut config);

    Ok(config)
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("settings.json"))
}

/// Get the default database path for the daemon.
pub fn database_path() -> Option<PathBuf> {
    config_dir().map(|p| p.join("daemon.db"))
}

/// Get the default worktree base directory.
pub fn worktree_dir() -> Option<PathBuf> {
    config_dir().map(|p| p.join("worktrees"))
}

fn config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/branchyard"))
    }
    #[cfg(not(target_os = "macos"))]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| std::env::var("HOME").ok().map(|h| PathBuf::from(h).join(".config")))
            .map(|p| p.join("branchyard"))
    }
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    let Config {
        daemon,
        processes,
        agent,
        remote,
    } = overlay;

    if daemon.database_path.is_some() {
        base.daemon.database_path = daemon.database_path;
    }
    if daemon.worktree_dir.is_some() {
        base.daemon.worktree_dir = daemon.worktree_dir;
    }
    if daemon.api_key.is_some() {
        base.daemon.api_key = daemon.api_key;
    }
    base.daemon.listen_addr = daemon.listen_addr;
    base.daemon.log_level = daemon.log_level;

    base.processes = processes;
    base.agent = agent;

    if remote.is_some() {
        base.remote = remote;
    }
}

fn apply_env_overrides(config: &mut Config) {
    if let Ok(val) = std::env::var("BRANCHYARD_LISTEN_ADDR")
        && let Ok(addr) = val.parse()
    {
        config.daemon.listen_addr = addr;
    }
    if let Ok(val) = std::env::var("BRANCHYARD_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Ok(val) = std::env::var("BRANCHYARD_RETENTION_SECS")
        && let Ok(n) = val.parse()
    {
        config.processes.retention_secs = n;
    }
    if let Ok(val) = std::env::var("BRANCHYARD_AGENT_BIN") {
        config.agent.program = PathBuf::from(val);
    }
    if let Ok(val) = std::env::var("BRANCHYARD_AGENT_MODEL") {
        config.agent.model = Some(val);
    }
    if let (Ok(url), Ok(api_key)) = (
        std::env::var("BRANCHYARD_REMOTE_URL"),
        std::env::var("BRANCHYARD_REMOTE_API_KEY"),
    ) {
        let timeout_ms = config
            .remote
            .as_ref()
            .map_or_else(default_remote_timeout_ms, |r| r.timeout_ms);
        config.remote = Some(RemoteConfig {
            url,
            api_key,
            timeout_ms,
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn default_retention_is_five_minutes() {
        let config = Config::default();
        assert_eq!(config.processes.retention_secs, 300);
    }

    #[test]
    fn default_agent_program_is_claude() {
        let config = Config::default();
        assert_eq!(config.agent.program, PathBuf::from("claude"));
        assert!(config.remote.is_none());
    }

    #[test]
    fn partial_file_keeps_section_defaults() {
        let parsed: Config =
            serde_json::from_str(r#"{"processes":{"retention_secs":10}}"#).unwrap();
        assert_eq!(parsed.processes.retention_secs, 10);
        assert_eq!(parsed.processes.terminate_grace_secs, 5);
        assert_eq!(parsed.daemon.log_level, "info");
    }

    #[test]
    fn project_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings_dir = dir.path().join(".branchyard");
        std::fs::create_dir_all(&settings_dir).unwrap();
        std::fs::write(
            settings_dir.join("settings.json"),
            r#"{"remote":{"url":"http://peer:47300","api_key":"k"},"agent":{"model":"opus"}}"#,
        )
        .unwrap();

        let config = load_config(Some(dir.path())).unwrap();
        let remote = config.remote.unwrap();
        assert_eq!(remote.url, "http://peer:47300");
        assert_eq!(remote.timeout_ms, 30_000);
        assert_eq!(config.agent.model.as_deref(), Some("opus"));
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(load_config_file(&path), Err(Error::Config(_))));
    }
}
