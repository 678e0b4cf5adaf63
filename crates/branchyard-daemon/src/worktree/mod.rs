//! Git worktree helper: one isolated working directory per (project, branch).

mod manager;

pub use manager::{WorktreeError, WorktreeManager, resolve_worktree_path};
