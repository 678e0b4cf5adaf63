//! Local ids of processes and sessions that actually run on the remote daemon.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use super::types::RemoteTarget;

/// What a local id refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteKind {
    Process,
    Session,
}

impl RemoteKind {
    /// Stream endpoint path for `remote_id` on the remote daemon.
    pub fn stream_path(self, remote_id: &str) -> String {
        match self {
            Self::Process => format!("/processes/{remote_id}/logs"),
            Self::Session => format!("/sessions/{remote_id}/stream"),
        }
    }
}

/// Where a remote-backed id lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteBinding {
    pub target: RemoteTarget,
    pub remote_id: String,
}

/// Orchestrator-owned map from local ids to remote bindings.
#[derive(Debug, Default)]
pub struct RemoteRegistry {
    entries: RwLock<HashMap<(RemoteKind, String), RemoteBinding>>,
}

impl RemoteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: RemoteKind, local_id: impl Into<String>, binding: RemoteBinding) {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert((kind, local_id.into()), binding);
    }

    pub fn lookup(&self, kind: RemoteKind, local_id: &str) -> Option<RemoteBinding> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(kind, local_id.to_string()))
            .cloned()
    }

    pub fn unregister(&self, kind: RemoteKind, local_id: &str) -> Option<RemoteBinding> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(kind, local_id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_lookup_unregister() {
        let registry = RemoteRegistry::new();
        let binding = RemoteBinding {
            target: RemoteTarget::new("http://remote", "k"),
            remote_id: "r-1".into(),
        };
        registry.register(RemoteKind::Process, "l-1", binding.clone());

        assert_eq!(registry.lookup(RemoteKind::Process, "l-1"), Some(binding.clone()));
        assert!(registry.lookup(RemoteKind::Session, "l-1").is_none());
        assert_eq!(registry.unregister(RemoteKind::Process, "l-1"), Some(binding));
        assert!(registry.lookup(RemoteKind::Process, "l-1").is_none());
    }

    #[test]
    fn stream_paths() {
        assert_eq!(RemoteKind::Process.stream_path("p"), "/processes/p/logs");
        assert_eq!(RemoteKind::Session.stream_path("s"), "/sessions/s/stream");
    }
}
