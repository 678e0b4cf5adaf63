//! Process manager types.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;

/// What to run.
#[derive(Debug, Clone, Default)]
pub struct StartSpec {
    /// Shell command line, run as `<shell> -c <command>`.
    pub command: String,
    pub cwd: PathBuf,
    pub use_pty: bool,
    /// Added to the daemon's own environment.
    pub env: HashMap<String, String>,
    /// Executor record this process belongs to, if any.
    pub executor_id: Option<String>,
}

impl StartSpec {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_pty(mut self, use_pty: bool) -> Self {
        self.use_pty = use_pty;
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Input for a pty process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessInput {
    Data(Bytes),
    Resize { cols: u16, rows: u16 },
}

/// Process manager settings.
#[derive(Debug, Clone)]
pub struct ProcessManagerConfig {
    /// Shell used to interpret commands.
    pub shell: String,
    /// How long a finished process stays queryable.
    pub retention: Duration,
    /// Delay between SIGTERM and SIGKILL on `stop`. `None` never escalates.
    pub kill_grace: Option<Duration>,
}

impl Default for ProcessManagerConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            retention: Duration::from_secs(5 * 60),
            kill_grace: Some(Duration::from_secs(5)),
        }
    }
}

impl From<&branchyard_core::config::ProcessConfig> for ProcessManagerConfig {
    fn from(config: &branchyard_core::config::ProcessConfig) -> Self {
        Self {
            shell: config.shell.clone(),
            retention: Duration::from_secs(config.retention_secs),
            kill_grace: (config.terminate_grace_secs > 0)
                .then(|| Duration::from_secs(config.terminate_grace_secs)),
        }
    }
}

/// Errors from spawning a process. Reported to viewers as log events, never
/// returned from `start`.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("Failed to spawn process: {reason}")]
    SpawnFailed { reason: String },

    #[error("Failed to open pty: {reason}")]
    Pty { reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
