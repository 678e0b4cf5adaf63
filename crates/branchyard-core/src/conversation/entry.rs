//! Conversation entries and the index-addressed conversation they live in.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::patch::{PatchOp, PatchOpKind};
use crate::error::{Error, Result};

/// One displayable item of an agent conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEntry {
    User {
        text: String,
    },
    Assistant {
        text: String,
    },
    Thinking {
        text: String,
    },
    ToolUse {
        tool: String,
        input: Value,
    },
    /// Replaces the `ToolUse` entry of the same call, so the input is kept.
    ToolResult {
        tool: String,
        input: Value,
        output: String,
        #[serde(default)]
        is_error: bool,
    },
    System {
        text: String,
    },
    Error {
        message: String,
    },
}

impl ConversationEntry {
    pub fn user(text: impl Into<String>) -> Self {
        Self::User { text: text.into() }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::System { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// An entry paired with its stable index, as sent in snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexedEntry {
    pub index: usize,
    #[serde(flatten)]
    pub entry: ConversationEntry,
}

/// Ordered map from stable index to entry.
///
/// Indices are handed out by an [`EntryIndexProvider`](super::EntryIndexProvider);
/// the conversation itself never invents one.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Conversation {
    entries: BTreeMap<usize, ConversationEntry>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&ConversationEntry> {
        self.entries.get(&index)
    }

    /// Store `entry` at `index`, returning the previous content if any.
    pub fn insert(&mut self, index: usize, entry: ConversationEntry) -> Option<ConversationEntry> {
        self.entries.insert(index, entry)
    }

    pub fn remove(&mut self, index: usize) -> Option<ConversationEntry> {
        self.entries.remove(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &ConversationEntry)> {
        self.entries.iter().map(|(i, e)| (*i, e))
    }

    /// Snapshot in index order.
    pub fn entries(&self) -> Vec<IndexedEntry> {
        self.iter()
            .map(|(index, entry)| IndexedEntry {
                index,
                entry: entry.clone(),
            })
            .collect()
    }

    /// Rebuild a conversation from a snapshot.
    pub fn from_entries(entries: impl IntoIterator<Item = IndexedEntry>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| (e.index, e.entry)).collect(),
        }
    }

    /// Apply patch operations in order.
    ///
    /// `add` must target a free index; `replace` and `remove` must target an
    /// existing one. On error, operations before the failing one stay applied.
    pub fn apply(&mut self, ops: &[PatchOp]) -> Result<()> {
        for op in ops {
            let index = op
                .index()
                .ok_or_else(|| Error::Patch(format!("bad path {}", op.path)))?;
            match op.op {
                PatchOpKind::Add => {
                    let value = op.value.clone().ok_or_else(|| {
                        Error::Patch(format!("add at {index} carries no value"))
                    })?;
                    if self.entries.contains_key(&index) {
                        return Err(Error::Patch(format!("add at occupied index {index}")));
                    }
                    self.entries.insert(index, value);
                }
                PatchOpKind::Replace => {
                    let value = op.value.clone().ok_or_else(|| {
                        Error::Patch(format!("replace at {index} carries no value"))
                    })?;
                    let slot = self
                        .entries
                        .get_mut(&index)
                        .ok_or_else(|| Error::Patch(format!("replace at missing index {index}")))?;
                    *slot = value;
                }
                PatchOpKind::Remove => {
                    if self.entries.remove(&index).is_none() {
                        return Err(Error::Patch(format!("remove at missing index {index}")));
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::conversation::ConversationPatch;
    use serde_json::json;

    #[test]
    fn entry_serializes_with_snake_case_tag() {
        let entry = ConversationEntry::ToolUse {
            tool: "Bash".into(),
            input: json!({"command": "ls"}),
        };
        assert_eq!(
            serde_json::to_value(&entry).unwrap(),
            json!({"type": "tool_use", "tool": "Bash", "input": {"command": "ls"}})
        );
    }

    #[test]
    fn indexed_entry_flattens() {
        let indexed = IndexedEntry {
            index: 3,
            entry: ConversationEntry::user("hi"),
        };
        let value = serde_json::to_value(&indexed).unwrap();
        assert_eq!(value, json!({"index": 3, "type": "user", "text": "hi"}));
        let back: IndexedEntry = serde_json::from_value(value).unwrap();
        assert_eq!(back, indexed);
    }

    #[test]
    fn apply_rejects_add_on_occupied_index() {
        let mut conv = Conversation::new();
        conv.insert(0, ConversationEntry::user("a"));
        let err = conv
            .apply(&[ConversationPatch::add(0, ConversationEntry::user("b"))])
            .unwrap_err();
        assert!(matches!(err, Error::Patch(_)));
        assert_eq!(conv.get(0), Some(&ConversationEntry::user("a")));
    }

    #[test]
    fn apply_rejects_replace_of_missing_index() {
        let mut conv = Conversation::new();
        assert!(
            conv.apply(&[ConversationPatch::replace(7, ConversationEntry::user("x"))])
                .is_err()
        );
        assert!(conv.apply(&[ConversationPatch::remove(7)]).is_err());
    }

    #[test]
    fn sparse_indices_keep_order() {
        let mut conv = Conversation::new();
        conv.insert(5, ConversationEntry::system("later"));
        conv.insert(1, ConversationEntry::system("earlier"));
        let indices: Vec<usize> = conv.entries().iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![1, 5]);
    }
}
