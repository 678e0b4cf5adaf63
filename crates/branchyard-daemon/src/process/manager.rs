//! Process manager: owns every spawned OS process and its log.
//!
//! Each process has one entry holding its ordered log and its subscribers
//! behind a single mutex. Output chunks are appended and broadcast while that
//! mutex is held, so the log and every live subscriber see the same order.

use std::collections::HashMap;
use std::io::Read as _;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use branchyard_core::log_event::LogEvent;

use crate::fanout::{EventSink, Subscribers, Subscription};
use crate::storage::{Database, NewExecutorProcess, ProcessStatus};

use super::pty;
use super::types::{ProcessError, ProcessInput, ProcessManagerConfig, StartSpec};

const READ_CHUNK: usize = 8192;

type Entry = Arc<Mutex<ProcessEntry>>;

struct ProcessEntry {
    is_pty: bool,
    log: Vec<LogEvent>,
    subscribers: Subscribers<LogEvent>,
    running: bool,
    stop_requested: bool,
    pid: Option<u32>,
    input: Option<mpsc::UnboundedSender<ProcessInput>>,
}

impl ProcessEntry {
    fn new(is_pty: bool) -> Self {
        Self {
            is_pty,
            log: vec![LogEvent::Init { is_pty }],
            subscribers: Subscribers::new(),
            running: true,
            stop_requested: false,
            pid: None,
            input: None,
        }
    }

    /// Append and broadcast. Nothing is accepted after a terminal event.
    fn push(&mut self, process_id: &str, event: LogEvent) {
        if self.log.last().is_some_and(LogEvent::is_terminal) {
            debug!(process_id, ?event, "Dropping event after terminal event");
            return;
        }
        self.subscribers.broadcast(process_id, &event);
        self.log.push(event);
    }
}

fn lock(entry: &Mutex<ProcessEntry>) -> MutexGuard<'_, ProcessEntry> {
    entry.lock().unwrap_or_else(PoisonError::into_inner)
}

struct Inner {
    processes: RwLock<HashMap<String, Entry>>,
    db: Database,
    config: ProcessManagerConfig,
}

impl Inner {
    fn get(&self, id: &str) -> Option<Entry> {
        self.processes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    fn insert(&self, id: String, entry: Entry) {
        self.processes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, entry);
    }

    fn evict(&self, id: &str) -> Option<Entry> {
        self.processes
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }
}

/// Spawns and tracks processes. Cheap to clone.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<Inner>,
}

impl ProcessManager {
    pub fn new(db: Database, config: ProcessManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                processes: RwLock::new(HashMap::new()),
                db,
                config,
            }),
        }
    }

    /// Spawn `spec` and return its id.
    ///
    /// Never fails: a spawn error is reported as a `stderr` chunk followed by
    /// `finished(1)` in the new process's log.
    pub async fn start(&self, spec: StartSpec) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        let entry: Entry = Arc::new(Mutex::new(ProcessEntry::new(spec.use_pty)));
        self.inner.insert(id.clone(), Arc::clone(&entry));

        let cwd = spec.cwd.to_string_lossy();
        if let Err(e) = self
            .inner
            .db
            .create_executor_process(NewExecutorProcess {
                id: &id,
                executor_id: spec.executor_id.as_deref(),
                command: &spec.command,
                working_dir: &cwd,
                is_pty: spec.use_pty,
            })
            .await
        {
            warn!(process_id = %id, error = %e, "Failed to record process");
        }

        let spawned = if spec.use_pty {
            self.spawn_pty(&id, &spec, &entry)
        } else {
            self.spawn_piped(&id, &spec, &entry)
        };

        match spawned {
            Ok(()) => {
                info!(
                    process_id = %id,
                    command = %spec.command,
                    cwd = %spec.cwd.display(),
                    use_pty = spec.use_pty,
                    "Process started"
                );
            }
            Err(e) => {
                warn!(process_id = %id, error = %e, "Process spawn failed");
                lock(&entry).push(&id, LogEvent::Stderr(Bytes::from(format!("{e}\n"))));
                complete(&self.inner, &id, &entry, 1).await;
            }
        }

        id
    }

    fn spawn_piped(&self, id: &str, spec: &StartSpec, entry: &Entry) -> Result<(), ProcessError> {
        let mut cmd = Command::new(&self.inner.config.shell);
        cmd.arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // Own process group, so stop reaches everything the shell started.
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|e| ProcessError::SpawnFailed {
            reason: e.to_string(),
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProcessError::SpawnFailed {
                reason: "Failed to capture stdout".to_string(),
            })?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ProcessError::SpawnFailed {
                reason: "Failed to capture stderr".to_string(),
            })?;

        lock(entry).pid = child.id();

        let out_task = tokio::spawn(pump(stdout, id.to_string(), Arc::clone(entry), LogEvent::Stdout));
        let err_task = tokio::spawn(pump(stderr, id.to_string(), Arc::clone(entry), LogEvent::Stderr));

        let inner = Arc::clone(&self.inner);
        let id = id.to_string();
        let entry = Arc::clone(entry);
        tokio::spawn(async move {
            let status = child.wait().await;
            // Drain both pipes so all output precedes `finished`.
            let _ = out_task.await;
            let _ = err_task.await;
            let exit_code = match status {
                Ok(status) => exit_code_of(status),
                Err(e) => {
                    warn!(process_id = %id, error = %e, "Failed to wait for process");
                    -1
                }
            };
            complete(&inner, &id, &entry, exit_code).await;
        });

        Ok(())
    }

    fn spawn_pty(&self, id: &str, spec: &StartSpec, entry: &Entry) -> Result<(), ProcessError> {
        let pty::PtyProcess {
            mut child,
            mut reader,
            input,
        } = pty::spawn(id, &self.inner.config.shell, spec)?;

        {
            let mut state = lock(entry);
            state.pid = child.process_id();
            state.input = Some(input);
        }

        let reader_task = {
            let id = id.to_string();
            let entry = Arc::clone(entry);
            tokio::task::spawn_blocking(move || {
                let mut buf = [0u8; READ_CHUNK];
                loop {
                    match reader.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            lock(&entry).push(&id, LogEvent::Pty(Bytes::copy_from_slice(&buf[..n])));
                        }
                    }
                }
                debug!(process_id = %id, "pty reader finished");
            })
        };

        let inner = Arc::clone(&self.inner);
        let id = id.to_string();
        let entry = Arc::clone(entry);
        tokio::spawn(async move {
            let status = tokio::task::spawn_blocking(move || child.wait()).await;
            let _ = reader_task.await;
            let exit_code = match status {
                Ok(Ok(status)) => i32::try_from(status.exit_code()).unwrap_or(-1),
                Ok(Err(e)) => {
                    warn!(process_id = %id, error = %e, "Failed to wait for pty process");
                    -1
                }
                Err(e) => {
                    warn!(process_id = %id, error = %e, "pty wait task failed");
                    -1
                }
            };
            complete(&inner, &id, &entry, exit_code).await;
        });

        Ok(())
    }

    /// Register `sink` for live events. `None` for unknown ids.
    ///
    /// History is not replayed; use [`attach`](Self::attach) to get both
    /// without a gap.
    #[must_use = "the returned Subscription must be held to keep receiving"]
    pub fn subscribe(&self, id: &str, sink: impl EventSink<LogEvent> + 'static) -> Option<Subscription> {
        let entry = self.inner.get(id)?;
        let sub_id = lock(&entry).subscribers.add(Arc::new(sink));
        Some(subscription(&entry, sub_id))
    }

    /// Buffered history plus a live subscription, taken atomically.
    #[must_use = "the returned Subscription must be held to keep receiving"]
    pub fn attach(
        &self,
        id: &str,
        sink: impl EventSink<LogEvent> + 'static,
    ) -> Option<(Vec<LogEvent>, Subscription)> {
        let entry = self.inner.get(id)?;
        let (history, sub_id) = {
            let mut state = lock(&entry);
            let history = state.log.clone();
            (history, state.subscribers.add(Arc::new(sink)))
        };
        Some((history, subscription(&entry, sub_id)))
    }

    pub fn get_logs(&self, id: &str) -> Option<Vec<LogEvent>> {
        let entry = self.inner.get(id)?;
        let logs = lock(&entry).log.clone();
        Some(logs)
    }

    /// Forward keyboard input or a resize to a pty process.
    ///
    /// `false` for unknown, finished and non-pty processes.
    pub fn handle_input(&self, id: &str, input: ProcessInput) -> bool {
        let Some(entry) = self.inner.get(id) else {
            return false;
        };
        let state = lock(&entry);
        match (&state.input, state.running) {
            (Some(tx), true) => tx.send(input).is_ok(),
            _ => {
                debug!(process_id = id, is_pty = state.is_pty, "Input rejected");
                false
            }
        }
    }

    /// Send SIGTERM to the process group. `false` if unknown or already finished.
    ///
    /// When a kill grace period is configured, SIGKILL follows if the process
    /// is still running after it.
    pub fn stop(&self, id: &str) -> bool {
        let Some(entry) = self.inner.get(id) else {
            return false;
        };
        let pid = {
            let mut state = lock(&entry);
            if !state.running {
                return false;
            }
            state.stop_requested = true;
            state.pid
        };
        let Some(pid) = pid else {
            return false;
        };

        info!(process_id = id, pid, "Stopping process");
        signal_group(pid, Signal::Term);

        if let Some(grace) = self.inner.config.kill_grace {
            let id = id.to_string();
            tokio::spawn(async move {
                tokio::time::sleep(grace).await;
                if lock(&entry).running {
                    warn!(process_id = %id, pid, "Process outlived grace period, killing");
                    signal_group(pid, Signal::Kill);
                }
            });
        }
        true
    }

    pub fn is_running(&self, id: &str) -> bool {
        self.inner.get(id).is_some_and(|e| lock(&e).running)
    }

    pub fn get_running_process_ids(&self) -> Vec<String> {
        self.inner
            .processes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, e)| lock(e).running)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn is_pty(&self, id: &str) -> Option<bool> {
        self.inner.get(id).map(|e| lock(&e).is_pty)
    }
}

fn subscription(entry: &Entry, sub_id: u64) -> Subscription {
    let weak = Arc::downgrade(entry);
    Subscription::new(sub_id, move || {
        if let Some(entry) = weak.upgrade() {
            lock(&entry).subscribers.remove(sub_id);
        }
    })
}

async fn pump<R>(mut reader: R, id: String, entry: Entry, wrap: fn(Bytes) -> LogEvent)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => lock(&entry).push(&id, wrap(Bytes::copy_from_slice(&buf[..n]))),
            Err(e) => {
                warn!(process_id = %id, error = %e, "Output read failed");
                break;
            }
        }
    }
}

/// Exit bookkeeping: leave the running set, emit `finished`, update the
/// record, then schedule eviction.
async fn complete(inner: &Arc<Inner>, id: &str, entry: &Entry, exit_code: i32) {
    let stop_requested = {
        let mut state = lock(entry);
        state.running = false;
        state.pid = None;
        state.input = None;
        state.push(id, LogEvent::Finished { exit_code });
        state.stop_requested
    };
    info!(process_id = id, exit_code, "Process finished");

    let status = if stop_requested {
        ProcessStatus::Killed
    } else {
        ProcessStatus::from_exit_code(exit_code)
    };
    if let Err(e) = inner
        .db
        .update_executor_process_status(id, status, Some(exit_code))
        .await
    {
        warn!(process_id = id, error = %e, "Failed to update process record");
    }

    let weak = Arc::downgrade(inner);
    let retention = inner.config.retention;
    let id = id.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(retention).await;
        if let Some(inner) = weak.upgrade()
            && let Some(entry) = inner.evict(&id)
        {
            lock(&entry).subscribers.clear();
            debug!(process_id = %id, "Evicted finished process");
        }
    });
}

#[cfg(unix)]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[derive(Debug, Clone, Copy)]
enum Signal {
    Term,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: Signal) {
    let sig = match signal {
        Signal::Term => libc::SIGTERM,
        Signal::Kill => libc::SIGKILL,
    };
    let Ok(pid) = i32::try_from(pid) else {
        return;
    };
    // SAFETY: kill(2) only sends a signal; the pid comes from a child we
    // spawned as its own process group leader.
    #[allow(unsafe_code)]
    let ret = unsafe { libc::kill(-pid, sig) };
    if ret != 0 {
        // Fall back to the leader alone.
        #[allow(unsafe_code)]
        let ret = unsafe { libc::kill(pid, sig) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            warn!(pid, ?signal, error = %err, "Failed to signal process");
        }
    }
}

#[cfg(not(unix))]
fn signal_group(pid: u32, signal: Signal) {
    warn!(pid, ?signal, "Signals are not supported on this platform");
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn manager(retention: Duration) -> ProcessManager {
        let db = Database::open_in_memory().await.unwrap();
        ProcessManager::new(
            db,
            ProcessManagerConfig {
                retention,
                ..ProcessManagerConfig::default()
            },
        )
    }

    async fn wait_finished(mgr: &ProcessManager, id: &str) -> Vec<LogEvent> {
        for _ in 0..200 {
            let logs = mgr.get_logs(id).unwrap();
            if logs.last().is_some_and(LogEvent::is_terminal) {
                return logs;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("process {id} did not finish");
    }

    #[tokio::test]
    async fn unknown_ids() {
        let mgr = manager(Duration::from_secs(60)).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(mgr.subscribe("nope", tx).is_none());
        assert!(mgr.get_logs("nope").is_none());
        assert!(!mgr.stop("nope"));
        assert!(!mgr.is_running("nope"));
        assert!(mgr.is_pty("nope").is_none());
        assert!(!mgr.handle_input("nope", ProcessInput::Data(Bytes::from_static(b"x"))));
    }

    #[tokio::test]
    async fn log_starts_with_init() {
        let mgr = manager(Duration::from_secs(60)).await;
        let id = mgr.start(StartSpec::new("true", std::env::temp_dir())).await;
        let logs = wait_finished(&mgr, &id).await;
        assert_eq!(logs.first(), Some(&LogEvent::Init { is_pty: false }));
        assert_eq!(logs.last(), Some(&LogEvent::Finished { exit_code: 0 }));
    }

    #[tokio::test]
    async fn spawn_failure_becomes_log_events() {
        let mgr = manager(Duration::from_secs(60)).await;
        let id = mgr
            .start(StartSpec::new("echo never", "/definitely/not/a/dir"))
            .await;
        let logs = wait_finished(&mgr, &id).await;
        assert!(matches!(logs[1], LogEvent::Stderr(_)));
        assert_eq!(logs[2], LogEvent::Finished { exit_code: 1 });
        assert!(!mgr.is_running(&id));

        let record = mgr.inner.db.get_executor_process(&id).await.unwrap();
        assert_eq!(record.status, "failed");
    }

    #[tokio::test]
    async fn non_pty_rejects_input() {
        let mgr = manager(Duration::from_secs(60)).await;
        let id = mgr.start(StartSpec::new("sleep 5", std::env::temp_dir())).await;
        assert_eq!(mgr.is_pty(&id), Some(false));
        assert!(!mgr.handle_input(&id, ProcessInput::Data(Bytes::from_static(b"x"))));
        assert!(mgr.stop(&id));
        wait_finished(&mgr, &id).await;
    }

    #[tokio::test]
    async fn stop_marks_record_killed() {
        let mgr = manager(Duration::from_secs(60)).await;
        let id = mgr.start(StartSpec::new("sleep 30", std::env::temp_dir())).await;
        assert!(mgr.is_running(&id));
        assert!(mgr.stop(&id));
        let logs = wait_finished(&mgr, &id).await;
        assert!(matches!(logs.last(), Some(LogEvent::Finished { exit_code }) if *exit_code != 0));
        assert!(!mgr.stop(&id), "second stop on a finished process");
        assert_eq!(
            mgr.inner.db.get_executor_process(&id).await.unwrap().status,
            "killed"
        );
    }

    #[tokio::test]
    async fn finished_process_is_evicted_after_retention() {
        let mgr = manager(Duration::from_millis(50)).await;
        let id = mgr.start(StartSpec::new("true", std::env::temp_dir())).await;
        wait_finished(&mgr, &id).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(mgr.get_logs(&id).is_none());
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(mgr.subscribe(&id, tx).is_none());
    }

    #[tokio::test]
    async fn dropped_subscription_stops_delivery() {
        let mgr = manager(Duration::from_secs(60)).await;
        let id = mgr
            .start(StartSpec::new("sleep 0.2; echo late", std::env::temp_dir()))
            .await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sub = mgr.subscribe(&id, tx).unwrap();
        drop(sub);
        wait_finished(&mgr, &id).await;
        assert!(rx.try_recv().is_err());
    }
}
