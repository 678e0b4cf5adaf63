//! Agent session types.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use branchyard_core::config::AgentConfig;
use branchyard_core::conversation::{IndexedEntry, PatchEnvelope};
use branchyard_core::session::{PermissionMode, SessionStatus};

/// How to launch the agent CLI.
#[derive(Debug, Clone)]
pub struct AgentSpawnConfig {
    pub program: PathBuf,
    /// Inserted before the stream-json flags.
    pub extra_args: Vec<String>,
    pub model: Option<String>,
    /// Wait after SIGTERM before SIGKILL.
    pub terminate_timeout: Duration,
}

impl Default for AgentSpawnConfig {
    fn default() -> Self {
        Self::from(&AgentConfig::default())
    }
}

impl From<&AgentConfig> for AgentSpawnConfig {
    fn from(config: &AgentConfig) -> Self {
        Self {
            program: config.program.clone(),
            extra_args: config.extra_args.clone(),
            model: config.model.clone(),
            terminate_timeout: Duration::from_secs(config.terminate_timeout_secs),
        }
    }
}

/// Event delivered to session subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Patch(PatchEnvelope),
    Status(SessionStatus),
}

/// Point-in-time view of a session, sent as the `init` frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSnapshot {
    pub id: String,
    pub project_id: String,
    pub branch: Option<String>,
    pub working_dir: PathBuf,
    pub permission_mode: PermissionMode,
    pub status: SessionStatus,
    /// Sequence number of the last patch included in `entries`.
    pub seq: u64,
    pub entries: Vec<IndexedEntry>,
}

/// Errors from launching the agent CLI.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Failed to spawn agent: {reason}")]
    SpawnFailed { reason: String },

    #[error("Working directory does not exist: {0}")]
    MissingWorkingDir(PathBuf),
}
