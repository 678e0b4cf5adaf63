//! Managed OS processes: spawn, buffer, fan out, input, stop, retention.

mod manager;
mod pty;
mod types;

pub use manager::ProcessManager;
pub use types::*;
