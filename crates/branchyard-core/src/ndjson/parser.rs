//! NDJSON parser for the agent protocol.
//!
//! Tolerant reader: unknown fields ignored, unknown types preserved as raw JSON.

use serde_json::Value;

use super::types::*;
use crate::error::{Error, Result};

/// Parse a single NDJSON line from the agent's stdout.
pub fn parse_line(line: &str) -> Result<Message> {
    let raw: Value = serde_json::from_str(line)?;
    parse_value(&raw)
}

/// Parse a JSON value into a canonical message.
pub fn parse_value(raw: &Value) -> Result<Message> {
    let msg_type = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::NdjsonParse("Missing 'type' field".into()))?;

    match msg_type {
        "system" if is_init(raw) => Ok(parse_system_init(raw)),
        "assistant" => Ok(parse_assistant(raw)),
        "user" => Ok(parse_user(raw)),
        "stream_event" => Ok(parse_stream_event(raw)),
        "result" => Ok(parse_result(raw)),
        _ => Ok(Message::Unknown {
            msg_type: msg_type.to_string(),
            payload: raw.clone(),
        }),
    }
}

fn is_init(raw: &Value) -> bool {
    raw.get("subtype")
        .and_then(Value::as_str)
        .is_none_or(|s| s == "init")
}

fn str_field(raw: &Value, key: &str) -> String {
    raw.get(key)
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string()
}

fn parse_system_init(raw: &Value) -> Message {
    Message::SystemInit(SystemInit {
        session_id: str_field(raw, "session_id"),
        model: str_field(raw, "model"),
        cwd: raw
            .get("cwd")
            .and_then(Value::as_str)
            .map(std::path::PathBuf::from)
            .unwrap_or_default(),
        permission_mode: raw
            .get("permissionMode")
            .or_else(|| raw.get("permission_mode"))
            .and_then(Value::as_str)
            .map(String::from),
    })
}

fn parse_assistant(raw: &Value) -> Message {
    let msg = raw.get("message").unwrap_or(raw);

    Message::Assistant(AssistantMessage {
        message_id: msg.get("id").and_then(Value::as_str).map(String::from),
        content: parse_content_blocks(msg.get("content")),
        stop_reason: parse_stop_reason(msg.get("stop_reason")),
    })
}

fn parse_content_blocks(content: Option<&Value>) -> Vec<ContentBlock> {
    match content {
        Some(Value::String(text)) => vec![ContentBlock::Text { text: text.clone() }],
        Some(Value::Array(arr)) => arr.iter().map(parse_content_block).collect(),
        _ => Vec::new(),
    }
}

fn parse_content_block(block: &Value) -> ContentBlock {
    let block_type = block.get("type").and_then(Value::as_str).unwrap_or("");
    match block_type {
        "text" => ContentBlock::Text {
            text: str_field(block, "text"),
        },
        "thinking" => ContentBlock::Thinking {
            thinking: str_field(block, "thinking"),
        },
        "tool_use" => match (
            block.get("id").and_then(Value::as_str),
            block.get("name").and_then(Value::as_str),
        ) {
            (Some(id), Some(name)) => ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input: block.get("input").cloned().unwrap_or(Value::Null),
            },
            _ => ContentBlock::Unknown(block.clone()),
        },
        _ => ContentBlock::Unknown(block.clone()),
    }
}

fn parse_stop_reason(val: Option<&Value>) -> StopReason {
    match val.and_then(Value::as_str) {
        Some("end_turn") | None => StopReason::EndTurn,
        Some("tool_use") => StopReason::ToolUse,
        Some("max_tokens") => StopReason::MaxTokens,
        Some(other) => StopReason::Unknown(other.to_string()),
    }
}

fn parse_user(raw: &Value) -> Message {
    let msg = raw.get("message").unwrap_or(raw);
    let content = msg
        .get("content")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|block| {
                    if block.get("type")?.as_str()? != "tool_result" {
                        return None;
                    }
                    Some(ToolResult {
                        tool_use_id: block.get("tool_use_id")?.as_str()?.to_string(),
                        content: tool_result_text(block.get("content")),
                        is_error: block
                            .get("is_error")
                            .and_then(Value::as_bool)
                            .unwrap_or(false),
                    })
                })
                .collect()
        })
        .unwrap_or_default();

    Message::User(UserMessage { content })
}

/// Tool results arrive either as a plain string or as an array of text blocks.
fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        Some(Value::Null) | None => String::new(),
        Some(other) => other.to_string(),
    }
}

#[allow(clippy::cast_possible_truncation)]
fn block_index(event: &Value) -> u32 {
    event.get("index").and_then(Value::as_u64).unwrap_or(0) as u32
}

fn parse_stream_event(raw: &Value) -> Message {
    let event = raw.get("event").unwrap_or(raw);
    let event_type = event.get("type").and_then(Value::as_str).unwrap_or("");

    let stream_type = match event_type {
        "message_start" => StreamEventType::MessageStart {
            message_id: event
                .get("message")
                .and_then(|m| m.get("id"))
                .and_then(Value::as_str)
                .map(String::from),
        },
        "content_block_start" => StreamEventType::ContentBlockStart {
            index: block_index(event),
            block_type: event
                .get("content_block")
                .and_then(|b| b.get("type"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string(),
        },
        "content_block_delta" => {
            let delta = event.get("delta").cloned().unwrap_or(Value::Null);
            let delta = match delta.get("type").and_then(Value::as_str).unwrap_or("") {
                "text_delta" => Delta::Text(str_field(&delta, "text")),
                "thinking_delta" => Delta::Thinking(str_field(&delta, "thinking")),
                "input_json_delta" => Delta::InputJson(str_field(&delta, "partial_json")),
                _ => Delta::Unknown(delta),
            };
            StreamEventType::ContentBlockDelta {
                index: block_index(event),
                delta,
            }
        }
        "content_block_stop" => StreamEventType::ContentBlockStop {
            index: block_index(event),
        },
        "message_delta" => StreamEventType::MessageDelta {
            stop_reason: event
                .get("delta")
                .and_then(|d| d.get("stop_reason"))
                .and_then(Value::as_str)
                .map(String::from),
        },
        "message_stop" => StreamEventType::MessageStop,
        _ => StreamEventType::Unknown(event.clone()),
    };

    Message::StreamEvent(StreamEvent {
        event_type: stream_type,
    })
}

fn parse_result(raw: &Value) -> Message {
    let subtype = match raw.get("subtype").and_then(Value::as_str) {
        Some("success") | None => ResultSubtype::Success,
        Some(other) if other.starts_with("error") => ResultSubtype::Error(other.to_string()),
        Some(other) => ResultSubtype::Unknown(other.to_string()),
    };

    let errors = raw
        .get("errors")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    Message::Result(SessionResult {
        subtype,
        is_error: raw.get("is_error").and_then(Value::as_bool).unwrap_or(false),
        session_id: str_field(raw, "session_id"),
        duration_ms: raw.get("duration_ms").and_then(Value::as_u64).unwrap_or(0),
        cost_usd: raw.get("total_cost_usd").and_then(Value::as_f64),
        result: raw.get("result").and_then(Value::as_str).map(String::from),
        errors,
    })
}
