//! Coding-agent sessions: subprocess lifecycle, event translation and the
//! patch-streamed conversation.

mod manager;
pub mod process;
pub mod translator;
mod types;

pub use manager::AgentSessionManager;
pub use translator::{EventTranslator, Update};
pub use types::*;
