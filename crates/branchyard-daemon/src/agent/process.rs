//! Agent CLI subprocess: spawning, stdin writer, stdout line reader and exit
//! supervision.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use branchyard_core::session::PermissionMode;

use super::types::{AgentError, AgentSpawnConfig};

const STDIN_BUFFER: usize = 32;
const STDOUT_BUFFER: usize = 256;

/// Control half of a running agent, kept in the session state.
#[derive(Debug)]
pub struct AgentControl {
    pub pid: Option<u32>,
    stdin_tx: mpsc::Sender<String>,
    kill_tx: oneshot::Sender<()>,
}

impl AgentControl {
    /// Queue one line for the agent's stdin without waiting. `false` when
    /// stdin is closed or the agent has stopped draining it.
    pub fn send_line(&self, line: String) -> bool {
        match self.stdin_tx.try_send(line) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(pid = ?self.pid, "Agent stdin backlog full, dropping line");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Close stdin and ask the supervisor to terminate the process.
    pub fn terminate(self) {
        drop(self.stdin_tx);
        let _ = self.kill_tx.send(());
    }
}

/// A freshly spawned agent.
#[derive(Debug)]
pub struct SpawnedAgent {
    pub control: AgentControl,
    /// stdout, one line per item, closed at EOF.
    pub stdout: mpsc::Receiver<String>,
    /// Exit code once the process is gone. `None` when killed by a signal.
    pub exit: oneshot::Receiver<Option<i32>>,
}

/// Stream-json `user` line for `text`.
pub fn user_message_line(text: &str) -> String {
    serde_json::json!({
        "type": "user",
        "message": {"role": "user", "content": text},
        "session_id": "default",
        "parent_tool_use_id": null,
    })
    .to_string()
}

/// Spawn the agent CLI in `working_dir`.
pub fn spawn(
    config: &AgentSpawnConfig,
    session_id: &str,
    working_dir: &Path,
    mode: PermissionMode,
    resume: Option<&str>,
) -> Result<SpawnedAgent, AgentError> {
    if !working_dir.is_dir() {
        return Err(AgentError::MissingWorkingDir(working_dir.to_path_buf()));
    }

    let mut cmd = Command::new(&config.program);
    cmd.current_dir(working_dir)
        .args(&config.extra_args)
        .arg("--output-format")
        .arg("stream-json")
        .arg("--input-format")
        .arg("stream-json")
        .arg("--verbose")
        .arg("--permission-mode")
        .arg(mode.cli_flag())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(ref model) = config.model {
        cmd.arg("--model").arg(model);
    }
    if let Some(resume) = resume {
        cmd.arg("--resume").arg(resume);
    }

    info!(
        session_id,
        program = %config.program.display(),
        working_dir = %working_dir.display(),
        mode = %mode,
        resume = ?resume,
        "Spawning agent subprocess"
    );
    let mut child = cmd.spawn().map_err(|e| AgentError::SpawnFailed {
        reason: e.to_string(),
    })?;

    let stdin = child.stdin.take().ok_or_else(|| AgentError::SpawnFailed {
        reason: "Failed to capture stdin".to_string(),
    })?;
    let stdout = child.stdout.take().ok_or_else(|| AgentError::SpawnFailed {
        reason: "Failed to capture stdout".to_string(),
    })?;

    let (stdin_tx, mut stdin_rx) = mpsc::channel::<String>(STDIN_BUFFER);
    let sid = session_id.to_string();
    tokio::spawn(async move {
        let mut stdin = stdin;
        while let Some(line) = stdin_rx.recv().await {
            if let Err(e) = stdin.write_all(line.as_bytes()).await {
                error!(session_id = %sid, "Failed to write to stdin: {}", e);
                break;
            }
            if let Err(e) = stdin.write_all(b"\n").await {
                error!(session_id = %sid, "Failed to write newline: {}", e);
                break;
            }
            if let Err(e) = stdin.flush().await {
                error!(session_id = %sid, "Failed to flush stdin: {}", e);
                break;
            }
        }
    });

    let (stdout_tx, stdout_rx) = mpsc::channel::<String>(STDOUT_BUFFER);
    let sid = session_id.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if stdout_tx.send(line).await.is_err() {
                debug!(session_id = %sid, "stdout channel closed");
                break;
            }
        }
        debug!(session_id = %sid, "stdout reader finished");
    });

    if let Some(stderr) = child.stderr.take() {
        let sid = session_id.to_string();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(session_id = %sid, "stderr: {}", line);
            }
        });
    }

    let pid = child.id();
    let (kill_tx, kill_rx) = oneshot::channel();
    let (exit_tx, exit_rx) = oneshot::channel();
    let sid = session_id.to_string();
    let timeout = config.terminate_timeout;
    tokio::spawn(async move {
        let code = supervise(child, kill_rx, timeout, &sid).await;
        let _ = exit_tx.send(code);
    });

    Ok(SpawnedAgent {
        control: AgentControl {
            pid,
            stdin_tx,
            kill_tx,
        },
        stdout: stdout_rx,
        exit: exit_rx,
    })
}

/// Wait for exit. On a kill request (or the control half being dropped),
/// SIGTERM, then SIGKILL after `timeout`.
async fn supervise(
    mut child: Child,
    kill_rx: oneshot::Receiver<()>,
    timeout: Duration,
    session_id: &str,
) -> Option<i32> {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill_rx => {
            if let Some(pid) = child.id() {
                send_sigterm(pid, session_id);
            }
            match tokio::time::timeout(timeout, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    warn!(session_id, "Timeout waiting for graceful shutdown, killing");
                    let _ = child.kill().await;
                    child.wait().await
                }
            }
        }
    };

    match status {
        Ok(status) => {
            info!(session_id, ?status, "Agent process exited");
            status.code()
        }
        Err(e) => {
            warn!(session_id, error = %e, "Error waiting for agent process");
            None
        }
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32, session_id: &str) {
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: pid is a valid process ID obtained from our own Child handle.
    // kill(2) with SIGTERM is safe to call on any owned subprocess.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(pid, libc::SIGTERM) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        warn!(session_id, pid, error = %err, "Failed to send SIGTERM");
    }
}

#[cfg(not(unix))]
fn send_sigterm(_pid: u32, _session_id: &str) {}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sh(script: &str) -> AgentSpawnConfig {
        AgentSpawnConfig {
            program: PathBuf::from("sh"),
            extra_args: vec!["-c".into(), script.into(), "agent".into()],
            model: None,
            terminate_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn user_line_shape() {
        let v: serde_json::Value = serde_json::from_str(&user_message_line("go")).unwrap();
        assert_eq!(v["type"], "user");
        assert_eq!(v["message"]["role"], "user");
        assert_eq!(v["message"]["content"], "go");
    }

    #[tokio::test]
    async fn flags_are_passed_after_extra_args() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = spawn(
            &sh(r#"echo "$@""#),
            "s1",
            dir.path(),
            PermissionMode::Edit,
            Some("agent-9"),
        )
        .unwrap();
        let line = agent.stdout.recv().await.unwrap();
        assert_eq!(
            line,
            "--output-format stream-json --input-format stream-json --verbose \
             --permission-mode acceptEdits --resume agent-9"
        );
        assert_eq!(agent.exit.await.unwrap(), Some(0));
    }

    #[tokio::test]
    async fn stdin_lines_reach_the_agent() {
        let dir = tempfile::tempdir().unwrap();
        let mut agent = spawn(
            &sh("read -r line; echo \"got $line\""),
            "s1",
            dir.path(),
            PermissionMode::Plan,
            None,
        )
        .unwrap();
        assert!(agent.control.send_line("hello".into()));
        assert_eq!(agent.stdout.recv().await.unwrap(), "got hello");
    }

    #[tokio::test]
    async fn send_line_fails_fast_when_agent_stops_reading() {
        let dir = tempfile::tempdir().unwrap();
        let agent = spawn(&sh("sleep 30"), "s1", dir.path(), PermissionMode::Plan, None).unwrap();
        let line = "x".repeat(64 * 1024);
        let accepted = tokio::time::timeout(Duration::from_secs(5), async {
            (0..STDIN_BUFFER * 8)
                .filter(|_| agent.control.send_line(line.clone()))
                .count()
        })
        .await
        .unwrap();
        assert!(accepted < STDIN_BUFFER * 8);
        agent.control.terminate();
    }

    #[tokio::test]
    async fn terminate_stops_a_long_running_agent() {
        let dir = tempfile::tempdir().unwrap();
        let agent = spawn(&sh("sleep 30"), "s1", dir.path(), PermissionMode::Plan, None).unwrap();
        agent.control.terminate();
        let code = tokio::time::timeout(Duration::from_secs(5), agent.exit)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(code, Some(0));
    }

    #[test]
    fn missing_working_dir_is_rejected() {
        let err = spawn(
            &sh("true"),
            "s1",
            Path::new("/definitely/not/here"),
            PermissionMode::Plan,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, AgentError::MissingWorkingDir(_)));
    }
}
