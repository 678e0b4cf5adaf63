//! Record store queries.

use branchyard_core::db::unix_timestamp;
use branchyard_core::session::{PermissionMode, SessionStatus};

use super::db::{Database, DatabaseError};
use super::models::{AgentSessionRecord, Executor, ExecutorProcess, ProcessStatus, Project};

/// Fields for a new executor process record.
#[derive(Debug, Clone)]
pub struct NewExecutorProcess<'a> {
    pub id: &'a str,
    pub executor_id: Option<&'a str>,
    pub command: &'a str,
    pub working_dir: &'a str,
    pub is_pty: bool,
}

/// Fields for a new agent session record.
#[derive(Debug, Clone)]
pub struct NewAgentSession<'a> {
    pub id: &'a str,
    pub project_id: &'a str,
    pub branch: Option<&'a str>,
    pub working_dir: &'a str,
    pub permission_mode: PermissionMode,
}

impl Database {
    // =========================================================================
    // Project queries
    // =========================================================================

    pub async fn create_project(
        &self,
        id: &str,
        name: &str,
        repo_path: &str,
    ) -> Result<Project, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO projects (id, name, repo_path, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(id)
        .bind(name)
        .bind(repo_path)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_project(id).await
    }

    pub async fn get_project(&self, id: &str) -> Result<Project, DatabaseError> {
        sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Project {id}")))
    }

    /// Update name and linked remote project id.
    pub async fn update_project(
        &self,
        id: &str,
        name: &str,
        remote_project_id: Option<&str>,
    ) -> Result<Project, DatabaseError> {
        let now = unix_timestamp();

        let result = sqlx::query(
            "UPDATE projects SET name = ?, remote_project_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(name)
        .bind(remote_project_id)
        .bind(now)
        .bind(id)
        .execute(self.pool())
        .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!("Project {id}")));
        }
        self.get_project(id).await
    }

    // =========================================================================
    // Executor queries
    // =========================================================================

    pub async fn create_executor(
        &self,
        id: &str,
        project_id: &str,
        branch: Option<&str>,
        working_dir: &str,
    ) -> Result<Executor, DatabaseError> {
        sqlx::query(
            r"
            INSERT INTO executors (id, project_id, branch, working_dir, created_at)
            VALUES (?, ?, ?, ?, ?)
            ",
        )
        .bind(id)
        .bind(project_id)
        .bind(branch)
        .bind(working_dir)
        .bind(unix_timestamp())
        .execute(self.pool())
        .await?;

        self.get_executor(id).await
    }

    pub async fn get_executor(&self, id: &str) -> Result<Executor, DatabaseError> {
        sqlx::query_as::<_, Executor>("SELECT * FROM executors WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Executor {id}")))
    }

    // =========================================================================
    // Executor process queries
    // =========================================================================

    /// Record a freshly spawned process with status `running`.
    pub async fn create_executor_process(
        &self,
        process: NewExecutorProcess<'_>,
    ) -> Result<ExecutorProcess, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO executor_processes
                (id, executor_id, command, working_dir, is_pty, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(process.id)
        .bind(process.executor_id)
        .bind(process.command)
        .bind(process.working_dir)
        .bind(process.is_pty)
        .bind(ProcessStatus::Running.as_str())
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_executor_process(process.id).await
    }

    pub async fn get_executor_process(&self, id: &str) -> Result<ExecutorProcess, DatabaseError> {
        sqlx::query_as::<_, ExecutorProcess>("SELECT * FROM executor_processes WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Executor process {id}")))
    }

    pub async fn update_executor_process_status(
        &self,
        id: &str,
        status: ProcessStatus,
        exit_code: Option<i32>,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE executor_processes SET status = ?, exit_code = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_str())
        .bind(exit_code)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    // =========================================================================
    // Agent session queries
    // =========================================================================

    pub async fn create_agent_session(
        &self,
        session: NewAgentSession<'_>,
    ) -> Result<AgentSessionRecord, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO agent_sessions
                (id, project_id, branch, working_dir, permission_mode, status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ",
        )
        .bind(session.id)
        .bind(session.project_id)
        .bind(session.branch)
        .bind(session.working_dir)
        .bind(session.permission_mode.as_str())
        .bind(SessionStatus::Starting.as_str())
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_agent_session(session.id).await
    }

    pub async fn get_agent_session(&self, id: &str) -> Result<AgentSessionRecord, DatabaseError> {
        sqlx::query_as::<_, AgentSessionRecord>("SELECT * FROM agent_sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Agent session {id}")))
    }

    pub async fn update_agent_session_status(
        &self,
        id: &str,
        status: SessionStatus,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE agent_sessions SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    /// Record a restart: new working directory and permission mode.
    pub async fn update_agent_session_mode(
        &self,
        id: &str,
        working_dir: &str,
        mode: PermissionMode,
    ) -> Result<(), DatabaseError> {
        sqlx::query(
            "UPDATE agent_sessions SET working_dir = ?, permission_mode = ?, updated_at = ? WHERE id = ?",
        )
        .bind(working_dir)
        .bind(mode.as_str())
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        Ok(())
    }

    /// Store the agent CLI's own session id (from `system`/`init`).
    pub async fn update_agent_session_id(
        &self,
        id: &str,
        agent_session_id: &str,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE agent_sessions SET agent_session_id = ?, updated_at = ? WHERE id = ?")
            .bind(agent_session_id)
            .bind(unix_timestamp())
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(())
    }

    pub async fn delete_agent_session(&self, id: &str) -> Result<bool, DatabaseError> {
        let result = sqlx::query("DELETE FROM agent_sessions WHERE id = ?")
            .bind(id)
            .execute(self.pool())
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    async fn test_db() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    #[tokio::test]
    async fn project_create_update() {
        let db = test_db().await;
        db.create_project("p1", "shop", "/repos/shop").await.unwrap();

        let updated = db
            .update_project("p1", "shop-web", Some("remote-p1"))
            .await
            .unwrap();
        assert_eq!(updated.name, "shop-web");
        assert_eq!(updated.remote_project_id.as_deref(), Some("remote-p1"));
    }

    #[tokio::test]
    async fn update_missing_project_is_not_found() {
        let db = test_db().await;
        let err = db.update_project("nope", "x", None).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound(_)));
    }

    #[tokio::test]
    async fn executor_requires_project() {
        let db = test_db().await;
        assert!(
            db.create_executor("e1", "missing", None, "/tmp")
                .await
                .is_err()
        );

        db.create_project("p1", "shop", "/repos/shop").await.unwrap();
        let exec = db
            .create_executor("e1", "p1", Some("feat/x"), "/tmp/wt")
            .await
            .unwrap();
        assert_eq!(exec.branch.as_deref(), Some("feat/x"));
    }

    #[tokio::test]
    async fn executor_process_lifecycle() {
        let db = test_db().await;
        let created = db
            .create_executor_process(NewExecutorProcess {
                id: "proc-1",
                executor_id: None,
                command: "echo hi",
                working_dir: "/tmp",
                is_pty: false,
            })
            .await
            .unwrap();
        assert_eq!(created.status, "running");
        assert!(created.exit_code.is_none());

        db.update_executor_process_status("proc-1", ProcessStatus::Failed, Some(2))
            .await
            .unwrap();
        let row = db.get_executor_process("proc-1").await.unwrap();
        assert_eq!(row.status, "failed");
        assert_eq!(row.exit_code, Some(2));
    }

    #[tokio::test]
    async fn agent_session_lifecycle() {
        let db = test_db().await;
        db.create_agent_session(NewAgentSession {
            id: "s1",
            project_id: "p1",
            branch: Some("main"),
            working_dir: "/tmp/wt",
            permission_mode: PermissionMode::Plan,
        })
        .await
        .unwrap();

        db.update_agent_session_status("s1", SessionStatus::Running)
            .await
            .unwrap();
        db.update_agent_session_mode("s1", "/tmp/wt2", PermissionMode::Edit)
            .await
            .unwrap();
        db.update_agent_session_id("s1", "agent-abc").await.unwrap();

        let row = db.get_agent_session("s1").await.unwrap();
        assert_eq!(row.status, "running");
        assert_eq!(row.permission_mode, "edit");
        assert_eq!(row.working_dir, "/tmp/wt2");
        assert_eq!(row.agent_session_id.as_deref(), Some("agent-abc"));

        assert!(db.delete_agent_session("s1").await.unwrap());
        assert!(!db.delete_agent_session("s1").await.unwrap());
    }
}
