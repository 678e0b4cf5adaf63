//! Record types stored by the daemon.

use serde::{Deserialize, Serialize};

/// Project record: a git repository the daemon works against.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub repo_path: String,
    /// Id of the same project on the paired remote daemon, if linked.
    pub remote_project_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Executor record: a (project, branch) working context.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Executor {
    pub id: String,
    pub project_id: String,
    pub branch: Option<String>,
    pub working_dir: String,
    pub created_at: i64,
}

/// One spawned OS process.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ExecutorProcess {
    pub id: String,
    pub executor_id: Option<String>,
    pub command: String,
    pub working_dir: String,
    pub is_pty: bool,
    pub status: String,
    pub exit_code: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Persisted core fields of an agent session.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AgentSessionRecord {
    pub id: String,
    pub project_id: String,
    pub branch: Option<String>,
    pub working_dir: String,
    pub permission_mode: String,
    pub status: String,
    /// Session id reported by the agent CLI itself, used for `--resume`.
    pub agent_session_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Executor process status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Running,
    Completed,
    Failed,
    Killed,
}

impl ProcessStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Killed => "killed",
        }
    }

    /// Status recorded for a process that exited with `exit_code`.
    pub const fn from_exit_code(exit_code: i32) -> Self {
        if exit_code == 0 {
            Self::Completed
        } else {
            Self::Failed
        }
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
