//! `Branchyard` Core Library
//!
//! Shared functionality for the `Branchyard` daemon and its clients:
//! - NDJSON parsing for the coding-agent stream-json protocol
//! - Conversation model, stable entry indices and the patch protocol
//! - Process log events, session vocabulary and socket frame types
//! - Configuration resolution and hierarchy
//! - Common error types

pub mod config;
pub mod conversation;
pub mod db;
pub mod error;
pub mod frames;
pub mod log_event;
pub mod ndjson;
pub mod session;
pub mod tracing_init;

pub use config::Config;
pub use error::{Error, Result};
