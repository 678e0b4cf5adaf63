//! Agent stream-json to conversation update translation.
//!
//! The translator only decides *what* changed. Index assignment and patch
//! generation happen in the session manager, which resolves each keyed
//! update through the session's `EntryTracker`.

use std::collections::{HashMap, VecDeque};

use branchyard_core::conversation::ConversationEntry;
use branchyard_core::ndjson::{
    self, AssistantMessage, ContentBlock, Delta, Message, ResultSubtype, SessionResult,
    StreamEvent, StreamEventType, SystemInit, UserMessage,
};
use serde_json::Value;
use tracing::{debug, warn};

/// One conversation mutation derived from an agent event.
#[derive(Debug, Clone, PartialEq)]
pub enum Update {
    /// A new entry with no correlation key.
    Append(ConversationEntry),
    /// Create the entry for `key`, or replace it if it already exists.
    Upsert { key: String, entry: ConversationEntry },
    /// The agent reported its own session id.
    AgentSessionId(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Text,
    Thinking,
}

impl BlockKind {
    fn entry(self, text: String) -> ConversationEntry {
        match self {
            Self::Text => ConversationEntry::Assistant { text },
            Self::Thinking => ConversationEntry::Thinking { text },
        }
    }
}

#[derive(Debug)]
struct StreamedBlock {
    key: String,
    kind: BlockKind,
    text: String,
}

/// Stateful translator for one agent process.
#[derive(Debug, Default)]
pub struct EventTranslator {
    /// Prepended to every correlation key. Distinct per process so a
    /// restarted agent never lands on a previous process's entries.
    key_prefix: String,
    /// Message id of the message currently being streamed.
    current_message: Option<String>,
    /// Counts `message_start` events, to key messages that carry no id.
    turns: u64,
    /// Streamed blocks of the current message by block index.
    blocks: HashMap<u32, StreamedBlock>,
    /// Streamed block keys per message id, in stream order, awaiting the
    /// complete `assistant` message.
    pending: HashMap<String, VecDeque<(BlockKind, String)>>,
    /// Tool calls by id: name and input, for pairing with results.
    tools: HashMap<String, (String, Value)>,
}

impl EventTranslator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Translator for the `generation`-th process of a session.
    pub fn for_generation(generation: u64) -> Self {
        Self {
            key_prefix: format!("g{generation}:"),
            ..Self::default()
        }
    }

    /// Keys of streamed blocks whose complete message never arrived. Clears
    /// all streaming state.
    pub fn take_unfinished(&mut self) -> Vec<String> {
        self.current_message = None;
        self.blocks.clear();
        self.pending
            .drain()
            .flat_map(|(_, queue)| queue.into_iter().map(|(_, key)| key))
            .collect()
    }

    /// Translate one stdout line. Lines that do not parse become a `system`
    /// entry carrying the raw text.
    pub fn convert_line(&mut self, line: &str) -> Vec<Update> {
        let line = line.trim();
        if line.is_empty() {
            return Vec::new();
        }
        match ndjson::parse_line(line) {
            Ok(msg) => self.convert(msg),
            Err(e) => {
                debug!(error = %e, "Unparseable agent output line");
                vec![Update::Append(ConversationEntry::system(line))]
            }
        }
    }

    pub fn convert(&mut self, msg: Message) -> Vec<Update> {
        match msg {
            Message::SystemInit(init) => Self::handle_system_init(init),
            Message::StreamEvent(event) => self.handle_stream_event(event),
            Message::Assistant(assistant) => self.handle_assistant(assistant),
            Message::User(user) => self.handle_user(user),
            Message::Result(result) => self.handle_result(&result),
            Message::Unknown { msg_type, payload } => {
                warn!(msg_type, "Unknown agent message type");
                vec![Update::Append(ConversationEntry::system(payload.to_string()))]
            }
        }
    }

    #[allow(clippy::needless_pass_by_value)]
    fn handle_system_init(init: SystemInit) -> Vec<Update> {
        let mut updates = Vec::new();
        if !init.session_id.is_empty() {
            updates.push(Update::AgentSessionId(init.session_id.clone()));
        }
        let text = if init.model.is_empty() {
            format!("Session started in {}", init.cwd.display())
        } else {
            format!("Session started ({}) in {}", init.model, init.cwd.display())
        };
        updates.push(Update::Append(ConversationEntry::system(text)));
        updates
    }

    fn handle_stream_event(&mut self, event: StreamEvent) -> Vec<Update> {
        match event.event_type {
            StreamEventType::MessageStart { message_id } => {
                self.turns += 1;
                self.current_message =
                    Some(message_id.unwrap_or_else(|| format!("turn-{}", self.turns)));
                self.blocks.clear();
                Vec::new()
            }
            StreamEventType::ContentBlockStart { index, block_type } => {
                let kind = match block_type.as_str() {
                    "text" => BlockKind::Text,
                    "thinking" => BlockKind::Thinking,
                    _ => return Vec::new(),
                };
                self.open_block(index, kind);
                Vec::new()
            }
            StreamEventType::ContentBlockDelta { index, delta } => {
                let (kind, chunk) = match delta {
                    Delta::Text(text) => (BlockKind::Text, text),
                    Delta::Thinking(text) => (BlockKind::Thinking, text),
                    // Tool input arrives complete in the `assistant` message.
                    Delta::InputJson(_) | Delta::Unknown(_) => return Vec::new(),
                };
                if chunk.is_empty() {
                    return Vec::new();
                }
                if !self.blocks.contains_key(&index) {
                    self.open_block(index, kind);
                }
                let Some(block) = self.blocks.get_mut(&index) else {
                    return Vec::new();
                };
                block.text.push_str(&chunk);
                vec![Update::Upsert {
                    key: block.key.clone(),
                    entry: block.kind.entry(block.text.clone()),
                }]
            }
            StreamEventType::ContentBlockStop { .. }
            | StreamEventType::MessageDelta { .. }
            | StreamEventType::MessageStop
            | StreamEventType::Unknown(_) => Vec::new(),
        }
    }

    fn open_block(&mut self, index: u32, kind: BlockKind) {
        let message = self.current_message.get_or_insert_with(|| {
            self.turns += 1;
            format!("turn-{}", self.turns)
        });
        let key = format!("{}msg:{message}:{index}", self.key_prefix);
        self.pending
            .entry(message.clone())
            .or_default()
            .push_back((kind, key.clone()));
        self.blocks.insert(
            index,
            StreamedBlock {
                key,
                kind,
                text: String::new(),
            },
        );
    }

    /// The complete message finalizes streamed blocks in place. Blocks that
    /// were never streamed become new entries.
    fn handle_assistant(&mut self, msg: AssistantMessage) -> Vec<Update> {
        let message = msg.message_id.or_else(|| self.current_message.clone());
        let mut updates = Vec::new();

        for block in msg.content {
            match block {
                ContentBlock::Text { text } => {
                    updates.extend(self.finalize(message.as_deref(), BlockKind::Text, text));
                }
                ContentBlock::Thinking { thinking } => {
                    updates.extend(self.finalize(
                        message.as_deref(),
                        BlockKind::Thinking,
                        thinking,
                    ));
                }
                ContentBlock::ToolUse { id, name, input } => {
                    self.tools.insert(id.clone(), (name.clone(), input.clone()));
                    updates.push(Update::Upsert {
                        key: self.tool_key(&id),
                        entry: ConversationEntry::ToolUse { tool: name, input },
                    });
                }
                ContentBlock::Unknown(raw) => {
                    updates.push(Update::Append(ConversationEntry::system(raw.to_string())));
                }
            }
        }

        if let Some(message) = &message
            && self.pending.get(message).is_some_and(VecDeque::is_empty)
        {
            self.pending.remove(message);
        }
        updates
    }

    fn finalize(&mut self, message: Option<&str>, kind: BlockKind, text: String) -> Option<Update> {
        let streamed = message.and_then(|m| {
            let queue = self.pending.get_mut(m)?;
            let pos = queue.iter().position(|(k, _)| *k == kind)?;
            queue.remove(pos).map(|(_, key)| key)
        });
        match streamed {
            Some(key) => Some(Update::Upsert {
                key,
                entry: kind.entry(text),
            }),
            None if text.is_empty() => None,
            None => Some(Update::Append(kind.entry(text))),
        }
    }

    fn handle_user(&mut self, msg: UserMessage) -> Vec<Update> {
        msg.content
            .into_iter()
            .map(|result| match self.tools.remove(&result.tool_use_id) {
                Some((tool, input)) => Update::Upsert {
                    key: self.tool_key(&result.tool_use_id),
                    entry: ConversationEntry::ToolResult {
                        tool,
                        input,
                        output: result.content,
                        is_error: result.is_error,
                    },
                },
                None => {
                    debug!(tool_use_id = %result.tool_use_id, "Tool result for unknown call");
                    Update::Append(ConversationEntry::ToolResult {
                        tool: "unknown".to_string(),
                        input: Value::Null,
                        output: result.content,
                        is_error: result.is_error,
                    })
                }
            })
            .collect()
    }

    fn handle_result(&mut self, result: &SessionResult) -> Vec<Update> {
        self.current_message = None;
        self.blocks.clear();
        self.pending.clear();
        if !result.is_real_error() {
            return Vec::new();
        }
        let message = if !result.errors.is_empty() {
            result.errors.join("\n")
        } else if let Some(text) = result.result.as_deref().filter(|t| !t.is_empty()) {
            text.to_string()
        } else {
            match &result.subtype {
                ResultSubtype::Error(subtype) | ResultSubtype::Unknown(subtype) => {
                    format!("Agent turn failed ({subtype})")
                }
                ResultSubtype::Success => "Agent turn failed".to_string(),
            }
        };
        vec![Update::Append(ConversationEntry::error(message))]
    }

    fn tool_key(&self, id: &str) -> String {
        format!("{}tool:{id}", self.key_prefix)
    }
}
