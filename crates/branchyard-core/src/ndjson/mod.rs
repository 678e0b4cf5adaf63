//! NDJSON parser for the coding-agent stream-json protocol.
//!
//! Parses newline-delimited JSON from the agent's stdout into canonical
//! message types. Tolerant reader: unknown fields are ignored and unknown
//! message or block types are kept as raw payloads instead of rejected.

mod parser;
mod types;

pub use parser::{parse_line, parse_value};
pub use types::*;
