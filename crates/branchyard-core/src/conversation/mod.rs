//! Agent conversation model: entries, stable indices and the patch protocol.

mod entry;
mod index;
mod patch;

pub use entry::{Conversation, ConversationEntry, IndexedEntry};
pub use index::{EntryIndexProvider, EntryTracker, TrackedIndex};
pub use patch::{ConversationPatch, PatchEnvelope, PatchOp, PatchOpKind};
