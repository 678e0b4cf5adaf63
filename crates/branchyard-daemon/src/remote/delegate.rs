//! Starting processes and agent sessions on the paired remote daemon.
//!
//! A successful start registers the remote id under a fresh local id, so the
//! stream server relays viewers of that local id to the remote.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde_json::{Value, json};
use tracing::{info, warn};

use branchyard_core::config::RemoteConfig;
use branchyard_core::session::PermissionMode;

use crate::process::StartSpec;
use crate::worktree::WorktreeManager;

use super::dual::create_worktree_dual;
use super::proxy::RemoteProxy;
use super::registry::{RemoteBinding, RemoteKind, RemoteRegistry};
use super::types::{DualTargetResult, ProxyOptions, RemoteProxyResult, RemoteTarget};

/// Outcome of a remote start.
#[derive(Debug, Clone)]
pub struct RemoteStart {
    /// Local id the remote process or session is registered under. `None`
    /// when the remote call failed or returned no id.
    pub local_id: Option<String>,
    pub result: RemoteProxyResult,
}

/// Owns the paired remote target and the proxy used to reach it.
#[derive(Debug, Clone)]
pub struct RemoteDelegate {
    proxy: RemoteProxy,
    target: RemoteTarget,
    timeout: Duration,
    registry: Arc<RemoteRegistry>,
}

impl RemoteDelegate {
    pub fn new(config: &RemoteConfig, registry: Arc<RemoteRegistry>) -> Result<Self, reqwest::Error> {
        Ok(Self {
            proxy: RemoteProxy::new()?,
            target: RemoteTarget::from(config),
            timeout: Duration::from_millis(config.timeout_ms),
            registry,
        })
    }

    pub const fn target(&self) -> &RemoteTarget {
        &self.target
    }

    /// Default options for calls to the paired remote.
    pub fn options(&self) -> ProxyOptions {
        ProxyOptions::default().with_timeout(self.timeout)
    }

    /// Forward an arbitrary call to the paired remote.
    pub async fn proxy(&self, method: Method, path: &str, body: Option<&Value>) -> RemoteProxyResult {
        self.proxy
            .proxy_to_remote(&self.target, method, path, body, self.options())
            .await
    }

    /// Start `spec` on the remote. `spec.cwd` is a path on the remote host.
    pub async fn start_remote_process(&self, spec: &StartSpec) -> RemoteStart {
        let body = json!({
            "command": spec.command,
            "cwd": spec.cwd,
            "use_pty": spec.use_pty,
            "env": spec.env,
            "executor_id": spec.executor_id,
        });
        let result = self.proxy(Method::POST, "/api/processes", Some(&body)).await;
        self.bind(RemoteKind::Process, result)
    }

    /// Get or create the agent session for `(project_id, branch)` on the
    /// remote. `working_dir` is a path on the remote host.
    pub async fn create_remote_session(
        &self,
        project_id: &str,
        branch: Option<&str>,
        working_dir: &Path,
        mode: PermissionMode,
    ) -> RemoteStart {
        let body = json!({
            "project_id": project_id,
            "branch": branch,
            "working_dir": working_dir,
            "permission_mode": mode,
        });
        let result = self.proxy(Method::POST, "/api/sessions", Some(&body)).await;
        self.bind(RemoteKind::Session, result)
    }

    /// Create the worktree locally, then on the remote project
    /// `remote_project_id`.
    pub async fn create_worktree(
        &self,
        worktrees: &WorktreeManager,
        remote_project_id: &str,
        project_root: &Path,
        branch: &str,
    ) -> (DualTargetResult, Option<PathBuf>) {
        create_worktree_dual(
            worktrees,
            &self.proxy,
            Some((&self.target, remote_project_id)),
            project_root,
            branch,
            self.options(),
        )
        .await
    }

    /// Forget a remote-backed id. Viewers of it are served locally again.
    pub fn release(&self, kind: RemoteKind, local_id: &str) -> Option<RemoteBinding> {
        self.registry.unregister(kind, local_id)
    }

    fn bind(&self, kind: RemoteKind, result: RemoteProxyResult) -> RemoteStart {
        if !result.ok {
            warn!(
                ?kind,
                request_id = %result.request_id,
                error_code = ?result.error_code,
                error = ?result.error,
                "Remote start failed"
            );
            return RemoteStart {
                local_id: None,
                result,
            };
        }
        let Some(remote_id) = created_id(&result.data) else {
            warn!(?kind, request_id = %result.request_id, "Remote start returned no id");
            return RemoteStart {
                local_id: None,
                result,
            };
        };

        let local_id = uuid::Uuid::new_v4().to_string();
        info!(?kind, %local_id, %remote_id, url = %self.target.url, "Registered remote-backed id");
        self.registry.register(
            kind,
            local_id.clone(),
            RemoteBinding {
                target: self.target.clone(),
                remote_id,
            },
        );
        RemoteStart {
            local_id: Some(local_id),
            result,
        }
    }
}

/// `id` of a created record, either top level or under `data`.
fn created_id(data: &Value) -> Option<String> {
    data.get("id")
        .or_else(|| data.get("data").and_then(|d| d.get("id")))
        .and_then(Value::as_str)
        .map(String::from)
}
