//! Branchyard daemon library.
//!
//! - Process manager for shell commands (piped or PTY) with buffered, fanned-out logs
//! - Agent session manager driving the coding-agent CLI over stream-json
//! - Remote proxy, stream relay and dual-target operations against a paired daemon
//! - `SQLite` record store and git worktree helper
//! - WebSocket stream server for live viewers

pub mod agent;
pub mod fanout;
pub mod process;
pub mod remote;
pub mod server;
pub mod storage;
pub mod worktree;
