//! `SQLite` record store for the Branchyard daemon.
//!
//! Persists projects, executors, executor processes and agent sessions.

mod db;
mod models;
mod queries;

pub use db::{Database, DatabaseError};
pub use models::*;
pub use queries::{NewAgentSession, NewExecutorProcess};
