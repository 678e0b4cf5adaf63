#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Agent session tests against a scripted agent that streams text deltas.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;

use branchyard_core::conversation::{
    Conversation, ConversationEntry, IndexedEntry, PatchEnvelope, PatchOpKind,
};
use branchyard_core::session::{PermissionMode, SessionStatus};
use branchyard_daemon::agent::{AgentSessionManager, AgentSpawnConfig, SessionEvent};
use branchyard_daemon::storage::Database;

/// Answers every input line with a streamed "Hello world" turn.
const STREAMING_AGENT: &str = r#"
echo '{"type":"system","subtype":"init","session_id":"agent-s","model":"fake","cwd":"/tmp"}'
n=0
while read -r line; do
  n=$((n + 1))
  echo "{\"type\":\"stream_event\",\"event\":{\"type\":\"message_start\",\"message\":{\"id\":\"msg_$n\"}}}"
  echo '{"type":"stream_event","event":{"type":"content_block_start","index":0,"content_block":{"type":"text"}}}'
  for w in Hel lo ' wor' ld; do
    echo "{\"type\":\"stream_event\",\"event\":{\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"$w\"}}}"
  done
  echo "{\"type\":\"assistant\",\"message\":{\"id\":\"msg_$n\",\"content\":[{\"type\":\"text\",\"text\":\"Hello world!\"}]}}"
  echo '{"type":"result","subtype":"success","is_error":false,"result":"Hello world!"}'
done
"#;

/// Streams deltas only, with no message ids and no final `assistant` line.
const ID_LESS_AGENT: &str = r#"
while read -r line; do
  echo '{"type":"stream_event","event":{"type":"message_start","message":{}}}'
  echo '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"answer"}}}'
  echo '{"type":"result","subtype":"success","is_error":false}'
done
"#;

/// Starts streaming a reply and dies before finishing it.
const DYING_AGENT: &str = r#"
read -r line
echo '{"type":"stream_event","event":{"type":"message_start","message":{"id":"msg_1"}}}'
echo '{"type":"stream_event","event":{"type":"content_block_start","index":0,"content_block":{"type":"text"}}}'
echo '{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Half a"}}}'
exit 1
"#;

async fn manager() -> AgentSessionManager {
    manager_running(STREAMING_AGENT).await
}

async fn manager_running(script: &str) -> AgentSessionManager {
    let db = Database::open_in_memory().await.unwrap();
    AgentSessionManager::new(
        db,
        AgentSpawnConfig {
            program: PathBuf::from("sh"),
            extra_args: vec!["-c".into(), script.into(), "agent".into()],
            model: None,
            terminate_timeout: Duration::from_secs(2),
        },
    )
}

/// Receive patches until one carries `entry`.
async fn patches_until(
    rx: &mut mpsc::UnboundedReceiver<SessionEvent>,
    entry: &ConversationEntry,
) -> Vec<PatchEnvelope> {
    let mut patches = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        if let SessionEvent::Patch(envelope) = event {
            let done = envelope.ops.iter().any(|op| op.value.as_ref() == Some(entry));
            patches.push(envelope);
            if done {
                return patches;
            }
        }
    }
}

fn assistant_count(entries: &[IndexedEntry]) -> usize {
    entries
        .iter()
        .filter(|e| matches!(e.entry, ConversationEntry::Assistant { .. }))
        .count()
}

async fn wait_for_assistants(mgr: &AgentSessionManager, id: &str, count: usize) -> Vec<IndexedEntry> {
    for _ in 0..250 {
        let entries = mgr.snapshot(id).await.unwrap().entries;
        if assistant_count(&entries) >= count {
            return entries;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session {id} never reached {count} assistant entries");
}

#[tokio::test]
async fn streamed_reply_is_one_add_then_replaces() {
    let mgr = manager().await;
    let dir = tempfile::tempdir().unwrap();
    let id = mgr
        .get_or_create_session("proj", Some("feature"), dir.path(), PermissionMode::Plan)
        .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = mgr.subscribe(&id, tx).await.unwrap();
    assert!(mgr.send_user_message(&id, "hi").await);

    let final_entry = ConversationEntry::Assistant {
        text: "Hello world!".into(),
    };
    let patches = patches_until(&mut rx, &final_entry).await;

    let mut by_index: BTreeMap<usize, Vec<PatchOpKind>> = BTreeMap::new();
    for op in patches.iter().flat_map(|p| &p.ops) {
        by_index.entry(op.index().unwrap()).or_default().push(op.op);
    }
    let assistant_index = patches
        .iter()
        .flat_map(|p| &p.ops)
        .find(|op| op.value.as_ref() == Some(&final_entry))
        .and_then(|op| op.index())
        .unwrap();

    let kinds = &by_index[&assistant_index];
    assert_eq!(kinds[0], PatchOpKind::Add);
    assert!(kinds[1..].iter().all(|k| *k == PatchOpKind::Replace));
    // Four deltas plus the final message, which differs from the streamed text.
    assert_eq!(kinds.len(), 5);

    for kinds in by_index.values() {
        assert_eq!(kinds.iter().filter(|k| **k == PatchOpKind::Add).count(), 1);
    }
}

#[tokio::test]
async fn patches_rebuild_the_conversation() {
    let mgr = manager().await;
    let dir = tempfile::tempdir().unwrap();
    let id = mgr
        .get_or_create_session("proj", None, dir.path(), PermissionMode::Plan)
        .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (snapshot, _subscription) = mgr.attach(&id, tx).await.unwrap();
    let mut mirror = Conversation::from_entries(snapshot.entries);
    let mut seq = snapshot.seq;

    assert!(mgr.send_user_message(&id, "first").await);
    let final_entry = ConversationEntry::Assistant {
        text: "Hello world!".into(),
    };
    let mut patches = patches_until(&mut rx, &final_entry).await;
    assert!(mgr.send_user_message(&id, "second").await);
    patches.extend(patches_until(&mut rx, &final_entry).await);

    for envelope in &patches {
        assert_eq!(envelope.seq, seq + 1);
        seq = envelope.seq;
        mirror.apply(&envelope.ops).unwrap();
    }

    let current = mgr.snapshot(&id).await.unwrap();
    assert_eq!(current.seq, seq);
    assert_eq!(mirror.entries(), current.entries);

    let users: Vec<_> = current
        .entries
        .iter()
        .filter_map(|e| match &e.entry {
            ConversationEntry::User { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(users, ["first", "second"]);

    let indices: Vec<usize> = current.entries.iter().map(|e| e.index).collect();
    assert!(indices.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn accept_plan_restarts_in_edit_mode() {
    let mgr = manager().await;
    let dir = tempfile::tempdir().unwrap();
    let id = mgr
        .get_or_create_session("proj", None, dir.path(), PermissionMode::Plan)
        .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let _subscription = mgr.subscribe(&id, tx).await.unwrap();

    assert!(mgr.accept_plan_and_restart(&id, dir.path(), "do the plan").await);
    let final_entry = ConversationEntry::Assistant {
        text: "Hello world!".into(),
    };
    patches_until(&mut rx, &final_entry).await;

    let snapshot = mgr.snapshot(&id).await.unwrap();
    assert_eq!(snapshot.permission_mode, PermissionMode::Edit);
    assert_eq!(snapshot.status, SessionStatus::Running);
    assert!(
        snapshot
            .entries
            .iter()
            .any(|e| e.entry == ConversationEntry::user("do the plan"))
    );

    assert!(mgr.stop_session(&id).await);
    assert_eq!(mgr.status(&id).await, Some(SessionStatus::Stopped));
}

#[tokio::test]
async fn restarted_agent_reply_does_not_overwrite_earlier_turn() {
    let mgr = manager_running(ID_LESS_AGENT).await;
    let dir = tempfile::tempdir().unwrap();
    let id = mgr
        .get_or_create_session("proj", None, dir.path(), PermissionMode::Plan)
        .await;

    assert!(mgr.send_user_message(&id, "a").await);
    let first = wait_for_assistants(&mgr, &id, 1).await;

    assert!(mgr.restart_session(&id, dir.path()).await);
    assert!(mgr.send_user_message(&id, "b").await);
    let second = wait_for_assistants(&mgr, &id, 2).await;

    assert_eq!(assistant_count(&second), 2);
    let kept = first
        .iter()
        .find(|e| matches!(e.entry, ConversationEntry::Assistant { .. }))
        .unwrap();
    assert!(second.contains(kept), "first reply keeps its index and text");
}

#[tokio::test]
async fn agent_dying_mid_stream_retracts_partial_reply() {
    let mgr = manager_running(DYING_AGENT).await;
    let dir = tempfile::tempdir().unwrap();
    let id = mgr
        .get_or_create_session("proj", None, dir.path(), PermissionMode::Plan)
        .await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    let (snapshot, _subscription) = mgr.attach(&id, tx).await.unwrap();
    let mut mirror = Conversation::from_entries(snapshot.entries);
    assert!(mgr.send_user_message(&id, "go").await);

    let mut kinds = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            SessionEvent::Patch(envelope) => {
                kinds.extend(envelope.ops.iter().map(|op| op.op));
                mirror.apply(&envelope.ops).unwrap();
            }
            SessionEvent::Status(SessionStatus::Error) => break,
            SessionEvent::Status(_) => {}
        }
    }

    assert!(kinds.contains(&PatchOpKind::Remove));
    let current = mgr.snapshot(&id).await.unwrap();
    assert_eq!(mirror.entries(), current.entries);
    assert_eq!(assistant_count(&current.entries), 0);
    assert_eq!(
        current.entries.last().map(|e| &e.entry),
        Some(&ConversationEntry::error(
            "Agent process exited unexpectedly (exit code 1)"
        ))
    );
}
