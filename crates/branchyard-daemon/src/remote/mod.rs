//! Paired remote daemon: HTTP forwarding, stream relay and dual-target
//! operations.

mod delegate;
pub mod dual;
mod proxy;
mod registry;
pub mod relay;
mod types;

pub use delegate::{RemoteDelegate, RemoteStart};
pub use dual::{create_worktree_dual, run_dual_target};
pub use proxy::{REQUEST_ID_HEADER, RemoteProxy};
pub use registry::{RemoteBinding, RemoteKind, RemoteRegistry};
pub use relay::{RelayError, relay_socket};
pub use types::*;
