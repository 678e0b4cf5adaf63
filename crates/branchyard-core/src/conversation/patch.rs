//! Patch protocol for pushing conversation changes to viewers.
//!
//! Operations address entries by stable index (`/entries/<index>`). Each
//! envelope carries a per-session sequence number; the subscribe-time snapshot
//! is sequence 0 and every envelope after it increments by one, so a viewer that
//! sees a gap knows to ask for a resync.

use serde::{Deserialize, Serialize};

use super::entry::{Conversation, ConversationEntry};

const ENTRIES_PREFIX: &str = "/entries/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PatchOpKind {
    Add,
    Replace,
    Remove,
}

/// A single patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchOp {
    pub op: PatchOpKind,
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<ConversationEntry>,
}

impl PatchOp {
    /// Entry index addressed by `path`, if the path is well formed.
    pub fn index(&self) -> Option<usize> {
        self.path.strip_prefix(ENTRIES_PREFIX)?.parse().ok()
    }
}

fn entry_path(index: usize) -> String {
    format!("{ENTRIES_PREFIX}{index}")
}

/// Wire envelope: `{"type":"patch","seq":n,"ops":[...]}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename = "patch")]
pub struct PatchEnvelope {
    pub seq: u64,
    pub ops: Vec<PatchOp>,
}

impl PatchEnvelope {
    pub const fn new(seq: u64, ops: Vec<PatchOp>) -> Self {
        Self { seq, ops }
    }
}

/// Builders for patch operations.
pub struct ConversationPatch;

impl ConversationPatch {
    pub fn add(index: usize, entry: ConversationEntry) -> PatchOp {
        PatchOp {
            op: PatchOpKind::Add,
            path: entry_path(index),
            value: Some(entry),
        }
    }

    pub fn replace(index: usize, entry: ConversationEntry) -> PatchOp {
        PatchOp {
            op: PatchOpKind::Replace,
            path: entry_path(index),
            value: Some(entry),
        }
    }

    pub fn remove(index: usize) -> PatchOp {
        PatchOp {
            op: PatchOpKind::Remove,
            path: entry_path(index),
            value: None,
        }
    }

    /// Minimal operations turning `prev` into `next`, in ascending index order.
    ///
    /// Unchanged entries produce nothing.
    pub fn diff(prev: &Conversation, next: &Conversation) -> Vec<PatchOp> {
        let mut ops = Vec::new();
        let mut old = prev.iter().peekable();
        let mut new = next.iter().peekable();

        loop {
            match (old.peek().copied(), new.peek().copied()) {
                (Some((oi, _)), Some((ni, _))) if oi < ni => {
                    ops.push(Self::remove(oi));
                    old.next();
                }
                (Some((oi, _)), Some((ni, ne))) if oi > ni => {
                    ops.push(Self::add(ni, ne.clone()));
                    new.next();
                }
                (Some((_, oe)), Some((ni, ne))) => {
                    if oe != ne {
                        ops.push(Self::replace(ni, ne.clone()));
                    }
                    old.next();
                    new.next();
                }
                (Some((oi, _)), None) => {
                    ops.push(Self::remove(oi));
                    old.next();
                }
                (None, Some((ni, ne))) => {
                    ops.push(Self::add(ni, ne.clone()));
                    new.next();
                }
                (None, None) => break,
            }
        }

        ops
    }
}
