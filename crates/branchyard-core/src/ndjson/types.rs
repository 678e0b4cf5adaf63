//! Message types for the agent NDJSON protocol.

use serde_json::Value;
use std::path::PathBuf;

/// Canonical message types emitted by the agent CLI.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    SystemInit(SystemInit),
    Assistant(AssistantMessage),
    User(UserMessage),
    StreamEvent(StreamEvent),
    Result(SessionResult),
    Unknown { msg_type: String, payload: Value },
}

/// `system`/`init` message sent once per agent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInit {
    pub session_id: String,
    pub model: String,
    pub cwd: PathBuf,
    pub permission_mode: Option<String>,
}

/// Complete assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssistantMessage {
    /// Provider message id; matches the id announced by `message_start`.
    pub message_id: Option<String>,
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
}

/// Content block in an assistant message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContentBlock {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse { id: String, name: String, input: Value },
    Unknown(Value),
}

/// Reason the assistant stopped.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum StopReason {
    #[default]
    EndTurn,
    ToolUse,
    MaxTokens,
    Unknown(String),
}

/// User message echoed by the agent (tool results).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMessage {
    pub content: Vec<ToolResult>,
}

/// Tool execution result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

/// Streaming event for real-time output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEvent {
    pub event_type: StreamEventType,
}

/// Stream event types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEventType {
    MessageStart { message_id: Option<String> },
    ContentBlockStart { index: u32, block_type: String },
    ContentBlockDelta { index: u32, delta: Delta },
    ContentBlockStop { index: u32 },
    MessageDelta { stop_reason: Option<String> },
    MessageStop,
    Unknown(Value),
}

/// Delta content in streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delta {
    Text(String),
    Thinking(String),
    InputJson(String),
    Unknown(Value),
}

/// Turn completion result.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionResult {
    pub subtype: ResultSubtype,
    pub is_error: bool,
    pub session_id: String,
    pub duration_ms: u64,
    pub cost_usd: Option<f64>,
    /// Final text of the turn, when the agent includes it.
    pub result: Option<String>,
    pub errors: Vec<String>,
}

impl SessionResult {
    /// `is_error` alone is not trusted: the agent sometimes reports it next to
    /// a successful subtype with no error messages.
    pub fn is_real_error(&self) -> bool {
        matches!(self.subtype, ResultSubtype::Error(_))
            || (self.is_error
                && (self.subtype != ResultSubtype::Success || !self.errors.is_empty()))
    }
}

/// Result subtype.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResultSubtype {
    #[default]
    Success,
    /// `error_*` subtypes, e.g. `error_max_turns`.
    Error(String),
    Unknown(String),
}
