//! JSON frames exchanged over the live socket endpoints.
//!
//! Process logs: the server sends `init`, the buffered history, then live
//! output, ending with `finished` or `error`. Agent sessions: the server sends
//! an `init` snapshot, then `patch` and `status` frames.

use serde::{Deserialize, Serialize};

use crate::conversation::{IndexedEntry, PatchEnvelope, PatchOp};
use crate::log_event::LogEvent;
use crate::session::SessionStatus;

/// Server to client, process log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessFrame {
    Init { is_pty: bool },
    Stdout { data: String },
    Stderr { data: String },
    Pty { data: String },
    Finished { exit_code: i32 },
    Error { message: String },
}

impl From<&LogEvent> for ProcessFrame {
    fn from(event: &LogEvent) -> Self {
        let text = |b: &bytes::Bytes| String::from_utf8_lossy(b).into_owned();
        match event {
            LogEvent::Init { is_pty } => Self::Init { is_pty: *is_pty },
            LogEvent::Stdout(b) => Self::Stdout { data: text(b) },
            LogEvent::Stderr(b) => Self::Stderr { data: text(b) },
            LogEvent::Pty(b) => Self::Pty { data: text(b) },
            LogEvent::Finished { exit_code } => Self::Finished {
                exit_code: *exit_code,
            },
            LogEvent::Error { message } => Self::Error {
                message: message.clone(),
            },
        }
    }
}

/// Client to server, process log stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProcessClientFrame {
    Input { data: String },
    Resize { cols: u16, rows: u16 },
}

/// Server to client, agent session stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionFrame {
    Init {
        seq: u64,
        status: SessionStatus,
        entries: Vec<IndexedEntry>,
    },
    Patch {
        seq: u64,
        ops: Vec<PatchOp>,
    },
    Status {
        status: SessionStatus,
    },
    Error {
        message: String,
    },
}

impl From<PatchEnvelope> for SessionFrame {
    fn from(env: PatchEnvelope) -> Self {
        Self::Patch {
            seq: env.seq,
            ops: env.ops,
        }
    }
}

/// Client to server, agent session stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionClientFrame {
    UserMessage { content: String },
    /// Ask for a fresh `init` snapshot after a sequence gap.
    Resync,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::conversation::{ConversationEntry, ConversationPatch};
    use bytes::Bytes;
    use serde_json::json;

    #[test]
    fn log_event_frames() {
        let frame = ProcessFrame::from(&LogEvent::Stdout(Bytes::from_static(b"hi\n")));
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "stdout", "data": "hi\n"})
        );
        let frame = ProcessFrame::from(&LogEvent::Finished { exit_code: 2 });
        assert_eq!(
            serde_json::to_value(&frame).unwrap(),
            json!({"type": "finished", "exit_code": 2})
        );
    }

    #[test]
    fn client_frames_parse() {
        let frame: ProcessClientFrame =
            serde_json::from_str(r#"{"type":"resize","cols":120,"rows":40}"#).unwrap();
        assert_eq!(frame, ProcessClientFrame::Resize { cols: 120, rows: 40 });

        let frame: SessionClientFrame =
            serde_json::from_str(r#"{"type":"user_message","content":"go"}"#).unwrap();
        assert_eq!(
            frame,
            SessionClientFrame::UserMessage {
                content: "go".into()
            }
        );
        let frame: SessionClientFrame = serde_json::from_str(r#"{"type":"resync"}"#).unwrap();
        assert_eq!(frame, SessionClientFrame::Resync);
    }

    #[test]
    fn patch_frame_matches_envelope_wire_shape() {
        let env = PatchEnvelope::new(1, vec![ConversationPatch::add(0, ConversationEntry::user("x"))]);
        let via_frame = serde_json::to_value(SessionFrame::from(env.clone())).unwrap();
        let via_envelope = serde_json::to_value(&env).unwrap();
        assert_eq!(via_frame, via_envelope);
    }
}
