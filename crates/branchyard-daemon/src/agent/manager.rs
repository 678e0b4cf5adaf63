//! Agent session manager.
//!
//! One session per `(project, branch)` while alive. Each session owns its
//! conversation, index tracker and subscriber set. Every stdout line of the
//! agent is translated and applied under the session's state lock, and the
//! resulting patch is broadcast before the next line is read.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::{debug, info, warn};

use branchyard_core::conversation::{
    Conversation, ConversationEntry, ConversationPatch, EntryTracker, PatchEnvelope, PatchOp,
};
use branchyard_core::session::{PermissionMode, SessionStatus};

use crate::fanout::{EventSink, Subscribers, Subscription};
use crate::storage::{Database, NewAgentSession};

use super::process::{self, AgentControl};
use super::translator::{EventTranslator, Update};
use super::types::{AgentSpawnConfig, SessionEvent, SessionSnapshot};

type SessionKey = (String, Option<String>);

struct SessionState {
    working_dir: PathBuf,
    mode: PermissionMode,
    status: SessionStatus,
    conversation: Conversation,
    tracker: EntryTracker,
    seq: u64,
    /// Bumped whenever the current process is replaced or torn down, so a
    /// stale pipeline never touches the session again.
    generation: u64,
    process: Option<AgentControl>,
    agent_session_id: Option<String>,
    translator: EventTranslator,
}

struct SessionHandle {
    id: String,
    project_id: String,
    branch: Option<String>,
    state: tokio::sync::Mutex<SessionState>,
    /// Separate from `state` so a dropped subscription can unsubscribe
    /// without awaiting.
    sinks: Mutex<Subscribers<SessionEvent>>,
    /// Whether the session holds its key as a live session. Readable under
    /// the registry lock without touching `state`.
    live: AtomicBool,
}

impl SessionHandle {
    fn sinks(&self) -> MutexGuard<'_, Subscribers<SessionEvent>> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn key(&self) -> SessionKey {
        (self.project_id.clone(), self.branch.clone())
    }

    fn is_live(&self) -> bool {
        self.live.load(Ordering::Acquire)
    }

    fn snapshot(&self, state: &SessionState) -> SessionSnapshot {
        SessionSnapshot {
            id: self.id.clone(),
            project_id: self.project_id.clone(),
            branch: self.branch.clone(),
            working_dir: state.working_dir.clone(),
            permission_mode: state.mode,
            status: state.status,
            seq: state.seq,
            entries: state.conversation.entries(),
        }
    }

    /// Broadcast `ops` as the next envelope. Called with the state lock held.
    fn publish(&self, state: &mut SessionState, ops: Vec<PatchOp>) {
        if ops.is_empty() {
            return;
        }
        state.seq += 1;
        let envelope = PatchEnvelope::new(state.seq, ops);
        self.sinks()
            .broadcast(&self.id, &SessionEvent::Patch(envelope));
    }

    fn append(&self, state: &mut SessionState, entry: ConversationEntry) {
        let index = state.tracker.provider().next();
        state.conversation.insert(index, entry.clone());
        self.publish(state, vec![ConversationPatch::add(index, entry)]);
    }
}

#[derive(Default)]
struct Registry {
    by_id: HashMap<String, Arc<SessionHandle>>,
    by_key: HashMap<SessionKey, String>,
}

struct Inner {
    registry: RwLock<Registry>,
    db: Database,
    config: AgentSpawnConfig,
}

impl Inner {
    async fn set_status(&self, handle: &SessionHandle, state: &mut SessionState, status: SessionStatus) {
        if state.status == status {
            return;
        }
        state.status = status;
        handle.live.store(status.is_alive(), Ordering::Release);
        handle
            .sinks()
            .broadcast(&handle.id, &SessionEvent::Status(status));
        if let Err(e) = self.db.update_agent_session_status(&handle.id, status).await {
            warn!(session_id = %handle.id, error = %e, "Failed to persist session status");
        }
    }

    /// Spawn a fresh agent process for the session and start its pipeline.
    async fn launch(self: &Arc<Self>, handle: &Arc<SessionHandle>, state: &mut SessionState) -> bool {
        state.generation += 1;
        let generation = state.generation;
        state.translator = EventTranslator::for_generation(generation);

        match process::spawn(
            &self.config,
            &handle.id,
            &state.working_dir,
            state.mode,
            state.agent_session_id.as_deref(),
        ) {
            Ok(agent) => {
                state.process = Some(agent.control);
                self.set_status(handle, state, SessionStatus::Running).await;
                tokio::spawn(run_pipeline(
                    Arc::clone(self),
                    Arc::clone(handle),
                    generation,
                    agent.stdout,
                    agent.exit,
                ));
                true
            }
            Err(e) => {
                warn!(session_id = %handle.id, error = %e, "Agent spawn failed");
                handle.append(state, ConversationEntry::error(e.to_string()));
                self.set_status(handle, state, SessionStatus::Error).await;
                false
            }
        }
    }

    /// Apply translated updates, returning the patch ops they produced.
    async fn apply(&self, handle: &SessionHandle, state: &mut SessionState, updates: Vec<Update>) -> Vec<PatchOp> {
        let mut ops = Vec::new();
        for update in updates {
            match update {
                Update::Append(entry) => {
                    let index = state.tracker.provider().next();
                    state.conversation.insert(index, entry.clone());
                    ops.push(ConversationPatch::add(index, entry));
                }
                Update::Upsert { key, entry } => {
                    let tracked = state.tracker.get_or_create(&key);
                    if tracked.is_new {
                        state.conversation.insert(tracked.index, entry.clone());
                        ops.push(ConversationPatch::add(tracked.index, entry));
                    } else if state.conversation.get(tracked.index) != Some(&entry) {
                        state.conversation.insert(tracked.index, entry.clone());
                        ops.push(ConversationPatch::replace(tracked.index, entry));
                    }
                }
                Update::AgentSessionId(agent_id) => {
                    debug!(session_id = %handle.id, agent_session_id = %agent_id, "Agent session id");
                    if let Err(e) = self.db.update_agent_session_id(&handle.id, &agent_id).await {
                        warn!(session_id = %handle.id, error = %e, "Failed to persist agent session id");
                    }
                    state.agent_session_id = Some(agent_id);
                }
            }
        }
        ops
    }
}

/// Reads agent stdout until EOF, then handles the exit. Stops touching the
/// session as soon as its generation moves on.
async fn run_pipeline(
    inner: Arc<Inner>,
    handle: Arc<SessionHandle>,
    generation: u64,
    mut stdout: mpsc::Receiver<String>,
    exit: oneshot::Receiver<Option<i32>>,
) {
    while let Some(line) = stdout.recv().await {
        let mut state = handle.state.lock().await;
        if state.generation != generation {
            return;
        }
        let updates = state.translator.convert_line(&line);
        let ops = inner.apply(&handle, &mut state, updates).await;
        handle.publish(&mut state, ops);
    }

    let code = exit.await.ok().flatten();
    let mut state = handle.state.lock().await;
    if state.generation != generation {
        return;
    }
    state.process = None;
    let message = match code {
        Some(code) => format!("Agent process exited unexpectedly (exit code {code})"),
        None => "Agent process exited unexpectedly".to_string(),
    };
    warn!(session_id = %handle.id, exit_code = ?code, "Agent process exited");

    // Half-streamed blocks are retracted rather than left looking complete.
    let before = state.conversation.clone();
    for key in state.translator.take_unfinished() {
        if let Some(index) = state.tracker.forget(&key) {
            state.conversation.remove(index);
        }
    }
    let index = state.tracker.provider().next();
    state
        .conversation
        .insert(index, ConversationEntry::error(message));
    let ops = ConversationPatch::diff(&before, &state.conversation);
    handle.publish(&mut state, ops);
    inner.set_status(&handle, &mut state, SessionStatus::Error).await;
}

/// Owns every agent session. Cheap to clone.
#[derive(Clone)]
pub struct AgentSessionManager {
    inner: Arc<Inner>,
}

impl AgentSessionManager {
    pub fn new(db: Database, config: AgentSpawnConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                registry: RwLock::new(Registry::default()),
                db,
                config,
            }),
        }
    }

    async fn get(&self, id: &str) -> Option<Arc<SessionHandle>> {
        self.inner.registry.read().await.by_id.get(id).cloned()
    }

    /// Return the live session for `(project_id, branch)`, or start a new one.
    ///
    /// A stopped or failed session for the same key is left in place (still
    /// reachable by id) and a new session with a fresh id takes over the key.
    /// Never waits on another session's state.
    pub async fn get_or_create_session(
        &self,
        project_id: &str,
        branch: Option<&str>,
        working_dir: &Path,
        mode: PermissionMode,
    ) -> String {
        let key: SessionKey = (project_id.to_string(), branch.map(str::to_string));

        let handle = {
            let mut registry = self.inner.registry.write().await;
            if let Some(existing) = registry
                .by_key
                .get(&key)
                .and_then(|id| registry.by_id.get(id))
                && existing.is_live()
            {
                debug!(session_id = %existing.id, project_id, ?branch, "Reusing live session");
                return existing.id.clone();
            }

            let id = uuid::Uuid::new_v4().to_string();
            let handle = Arc::new(SessionHandle {
                id: id.clone(),
                project_id: project_id.to_string(),
                branch: key.1.clone(),
                state: tokio::sync::Mutex::new(SessionState {
                    working_dir: working_dir.to_path_buf(),
                    mode,
                    status: SessionStatus::Starting,
                    conversation: Conversation::new(),
                    tracker: EntryTracker::new(),
                    seq: 0,
                    generation: 0,
                    process: None,
                    agent_session_id: None,
                    translator: EventTranslator::new(),
                }),
                sinks: Mutex::new(Subscribers::new()),
                live: AtomicBool::new(true),
            });
            registry.by_id.insert(id.clone(), Arc::clone(&handle));
            registry.by_key.insert(key, id);
            handle
        };

        let working = working_dir.to_string_lossy();
        if let Err(e) = self
            .inner
            .db
            .create_agent_session(NewAgentSession {
                id: &handle.id,
                project_id,
                branch,
                working_dir: &working,
                permission_mode: mode,
            })
            .await
        {
            warn!(session_id = %handle.id, error = %e, "Failed to record agent session");
        }

        info!(session_id = %handle.id, project_id, ?branch, %mode, "Creating agent session");
        let mut state = handle.state.lock().await;
        self.inner.launch(&handle, &mut state).await;
        drop(state);
        handle.id.clone()
    }

    /// Forward `text` to the agent and append it to the conversation.
    ///
    /// `false` when the session is unknown, not running, or its agent has
    /// stopped reading input; the message is dropped, not queued.
    pub async fn send_user_message(&self, id: &str, text: &str) -> bool {
        let Some(handle) = self.get(id).await else {
            return false;
        };
        let mut state = handle.state.lock().await;
        if state.status != SessionStatus::Running {
            debug!(session_id = id, status = %state.status, "Dropping message for idle session");
            return false;
        }
        let Some(process) = state.process.as_ref() else {
            return false;
        };
        if !process.send_line(process::user_message_line(text)) {
            warn!(session_id = id, "Agent not accepting input");
            return false;
        }
        handle.append(&mut state, ConversationEntry::user(text));
        true
    }

    /// Terminate the agent and mark the session stopped. The conversation is
    /// kept. `false` if unknown or not alive.
    pub async fn stop_session(&self, id: &str) -> bool {
        let Some(handle) = self.get(id).await else {
            return false;
        };
        let mut state = handle.state.lock().await;
        if !state.status.is_alive() {
            return false;
        }
        state.generation += 1;
        if let Some(process) = state.process.take() {
            process.terminate();
        }
        info!(session_id = id, "Stopping agent session");
        self.inner
            .set_status(&handle, &mut state, SessionStatus::Stopped)
            .await;
        true
    }

    /// Stop the session and forget it entirely.
    pub async fn delete_session(&self, id: &str) -> bool {
        let handle = {
            let mut registry = self.inner.registry.write().await;
            let Some(handle) = registry.by_id.remove(id) else {
                return false;
            };
            let key = handle.key();
            if registry.by_key.get(&key).is_some_and(|current| current == id) {
                registry.by_key.remove(&key);
            }
            handle
        };

        {
            let mut state = handle.state.lock().await;
            state.generation += 1;
            if let Some(process) = state.process.take() {
                process.terminate();
            }
        }
        handle.sinks().clear();

        if let Err(e) = self.inner.db.delete_agent_session(id).await {
            warn!(session_id = id, error = %e, "Failed to delete agent session record");
        }
        info!(session_id = id, "Deleted agent session");
        true
    }

    /// Kill and respawn the agent, keeping id, key and conversation.
    pub async fn restart_session(&self, id: &str, working_dir: &Path) -> bool {
        self.respawn(id, working_dir, None).await
    }

    /// Restart with a different permission mode. The agent fixes its mode at
    /// process start, so this is the only way to change it.
    pub async fn switch_mode(&self, id: &str, working_dir: &Path, mode: PermissionMode) -> bool {
        self.respawn(id, working_dir, Some(mode)).await
    }

    /// Switch to `edit` and hand the approved plan to the new process as its
    /// first message.
    pub async fn accept_plan_and_restart(&self, id: &str, working_dir: &Path, plan: &str) -> bool {
        if !self.switch_mode(id, working_dir, PermissionMode::Edit).await {
            return false;
        }
        self.send_user_message(id, plan).await
    }

    /// Refuses when another live session has taken over the key since this
    /// one died.
    async fn respawn(&self, id: &str, working_dir: &Path, mode: Option<PermissionMode>) -> bool {
        let Some(handle) = self.get(id).await else {
            return false;
        };
        // Lock order is session state, then registry. Registry holders never
        // wait on a session.
        let mut state = handle.state.lock().await;
        {
            let mut registry = self.inner.registry.write().await;
            if !registry.by_id.contains_key(id) {
                return false;
            }
            let key = handle.key();
            if let Some(owner) = registry.by_key.get(&key)
                && owner != id
                && registry.by_id.get(owner).is_some_and(|h| h.is_live())
            {
                info!(session_id = id, owner = %owner, "Key taken by a live session, not restarting");
                return false;
            }
            registry.by_key.insert(key, id.to_string());
            handle.live.store(true, Ordering::Release);
        }

        if let Some(process) = state.process.take() {
            process.terminate();
        }
        state.working_dir = working_dir.to_path_buf();
        if let Some(mode) = mode {
            state.mode = mode;
        }

        if let Err(e) = self
            .inner
            .db
            .update_agent_session_mode(id, &working_dir.to_string_lossy(), state.mode)
            .await
        {
            warn!(session_id = id, error = %e, "Failed to persist session mode");
        }

        info!(session_id = id, mode = %state.mode, working_dir = %working_dir.display(), "Restarting agent session");
        self.inner
            .set_status(&handle, &mut state, SessionStatus::Starting)
            .await;
        self.inner.launch(&handle, &mut state).await
    }

    /// Register `sink` for live patches and status changes. `None` for
    /// unknown ids.
    #[must_use = "the returned Subscription must be held to keep receiving"]
    pub async fn subscribe(
        &self,
        id: &str,
        sink: impl EventSink<SessionEvent> + 'static,
    ) -> Option<Subscription> {
        let handle = self.get(id).await?;
        let sub_id = handle.sinks().add(Arc::new(sink));
        Some(subscription(&handle, sub_id))
    }

    /// Snapshot plus live subscription with no patch missed or repeated.
    #[must_use = "the returned Subscription must be held to keep receiving"]
    pub async fn attach(
        &self,
        id: &str,
        sink: impl EventSink<SessionEvent> + 'static,
    ) -> Option<(SessionSnapshot, Subscription)> {
        let handle = self.get(id).await?;
        let state = handle.state.lock().await;
        let snapshot = handle.snapshot(&state);
        let sub_id = handle.sinks().add(Arc::new(sink));
        drop(state);
        Some((snapshot, subscription(&handle, sub_id)))
    }

    pub async fn snapshot(&self, id: &str) -> Option<SessionSnapshot> {
        let handle = self.get(id).await?;
        let state = handle.state.lock().await;
        Some(handle.snapshot(&state))
    }

    pub async fn status(&self, id: &str) -> Option<SessionStatus> {
        let handle = self.get(id).await?;
        let status = handle.state.lock().await.status;
        Some(status)
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.inner.registry.read().await.by_id.keys().cloned().collect()
    }
}

fn subscription(handle: &Arc<SessionHandle>, sub_id: u64) -> Subscription {
    let weak = Arc::downgrade(handle);
    Subscription::new(sub_id, move || {
        if let Some(handle) = weak.upgrade() {
            handle.sinks().remove(sub_id);
        }
    })
}
