//! Operations performed on both the local and the paired remote daemon.
//!
//! The local half runs first and decides the outcome: if it fails, nothing is
//! sent to the remote. If it succeeds and the remote half fails, the result is
//! a partial success carrying the remote failure.

use std::fmt::Display;
use std::future::Future;
use std::path::{Path, PathBuf};

use reqwest::Method;
use tracing::{info, warn};

use crate::worktree::WorktreeManager;

use super::proxy::RemoteProxy;
use super::types::{
    DualTargetResult, LocalOutcome, ProxyOptions, RemoteOutcome, RemoteProxyResult, RemoteTarget,
};

/// Run `local`, then `remote` if there is one.
///
/// `remote` is a future, so nothing happens on the remote side unless the
/// local half succeeded and it is awaited here.
pub async fn run_dual_target<T, E, R>(
    local: impl Future<Output = Result<T, E>>,
    remote: Option<R>,
) -> (DualTargetResult, Option<T>)
where
    E: Display,
    R: Future<Output = RemoteProxyResult>,
{
    let value = match local.await {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Local half failed, skipping remote");
            return (
                DualTargetResult {
                    status_code: DualTargetResult::LOCAL_FAILED,
                    local: LocalOutcome {
                        success: false,
                        error: Some(e.to_string()),
                    },
                    remote: None,
                },
                None,
            );
        }
    };

    let local = LocalOutcome {
        success: true,
        error: None,
    };
    let Some(remote) = remote else {
        return (
            DualTargetResult {
                status_code: DualTargetResult::CREATED,
                local,
                remote: None,
            },
            Some(value),
        );
    };

    let result = remote.await;
    let status_code = if result.ok {
        DualTargetResult::CREATED
    } else {
        warn!(
            request_id = %result.request_id,
            error_code = ?result.error_code,
            error = ?result.error,
            "Remote half failed, reporting partial success"
        );
        DualTargetResult::PARTIAL
    };
    let remote = RemoteOutcome {
        success: result.ok,
        error: if result.ok { None } else { result.error },
        error_code: result.error_code,
        request_id: Some(result.request_id),
    };

    (
        DualTargetResult {
            status_code,
            local,
            remote: Some(remote),
        },
        Some(value),
    )
}

/// Create the worktree for `branch` locally, then on the remote daemon when
/// one is paired.
///
/// Returns the local worktree path when the local half succeeded.
pub async fn create_worktree_dual(
    worktrees: &WorktreeManager,
    proxy: &RemoteProxy,
    remote: Option<(&RemoteTarget, &str)>,
    project_root: &Path,
    branch: &str,
    options: ProxyOptions,
) -> (DualTargetResult, Option<PathBuf>) {
    let remote_call = remote.map(|(target, remote_project_id)| {
        let body = serde_json::json!({
            "project_id": remote_project_id,
            "branch": branch,
        });
        async move {
            proxy
                .proxy_to_remote(target, Method::POST, "/api/worktrees", Some(&body), options)
                .await
        }
    });

    let (result, path) = run_dual_target(worktrees.ensure(project_root, branch), remote_call).await;
    info!(
        branch,
        status_code = result.status_code,
        local = result.local.success,
        remote = ?result.remote.as_ref().map(|r| r.success),
        "Dual-target worktree creation finished"
    );
    (result, path)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::remote::RemoteErrorCode;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn remote_result(ok: bool) -> RemoteProxyResult {
        RemoteProxyResult {
            ok,
            status: if ok { 201 } else { 500 },
            data: serde_json::Value::Null,
            error: (!ok).then(|| "boom".to_string()),
            error_code: (!ok).then_some(RemoteErrorCode::ServerError),
            request_id: "req".into(),
            duration_ms: 1,
        }
    }

    #[tokio::test]
    async fn both_succeed_is_created() {
        let (result, value) =
            run_dual_target(async { Ok::<_, String>(7) }, Some(async { remote_result(true) })).await;
        assert_eq!(result.status_code, 201);
        assert_eq!(value, Some(7));
        assert!(result.remote.unwrap().success);
    }

    #[tokio::test]
    async fn remote_failure_is_partial() {
        let (result, value) =
            run_dual_target(async { Ok::<_, String>(()) }, Some(async { remote_result(false) }))
                .await;
        assert!(result.is_partial());
        assert!(result.is_success());
        assert!(value.is_some());
        let remote = result.remote.unwrap();
        assert!(!remote.success);
        assert_eq!(remote.error_code, Some(RemoteErrorCode::ServerError));
        assert_eq!(remote.request_id.as_deref(), Some("req"));
    }

    #[tokio::test]
    async fn local_failure_skips_remote() {
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        let (result, value) = run_dual_target(
            async { Err::<(), _>("disk full") },
            Some(async move {
                flag.store(true, Ordering::SeqCst);
                remote_result(true)
            }),
        )
        .await;
        assert!(!result.is_success());
        assert_eq!(result.local.error.as_deref(), Some("disk full"));
        assert!(result.remote.is_none());
        assert!(value.is_none());
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn no_remote_is_local_only() {
        let (result, _) = run_dual_target(
            async { Ok::<_, String>(()) },
            None::<std::future::Ready<RemoteProxyResult>>,
        )
        .await;
        assert_eq!(result.status_code, 201);
        assert!(result.remote.is_none());
    }
}
