//! Stable index assignment for conversation entries.

use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

#[derive(Debug, Default)]
struct ProviderState {
    next: usize,
    issued: bool,
}

/// Monotonic counter that is the only source of entry indices for one
/// conversation.
///
/// Every index returned by [`next`](Self::next) is unique and larger than the
/// previous one. `reset` and `set_index` can position a fresh provider (for
/// example when resuming a stored conversation) but are ignored once an index
/// has been handed out.
#[derive(Debug, Default)]
pub struct EntryIndexProvider {
    state: Mutex<ProviderState>,
}

impl EntryIndexProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provider whose first index is `start`.
    pub fn starting_at(start: usize) -> Self {
        Self {
            state: Mutex::new(ProviderState {
                next: start,
                issued: false,
            }),
        }
    }

    /// Issue the next index.
    pub fn next(&self) -> usize {
        let mut state = self.lock();
        let index = state.next;
        state.next += 1;
        state.issued = true;
        index
    }

    /// The index the next call to [`next`](Self::next) will return.
    pub fn current(&self) -> usize {
        self.lock().next
    }

    pub fn reset(&self) {
        self.set_index(0);
    }

    pub fn set_index(&self, index: usize) {
        let mut state = self.lock();
        if state.issued {
            debug!(
                requested = index,
                next = state.next,
                "Ignoring reposition of a provider that already issued indices"
            );
            return;
        }
        state.next = index;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ProviderState> {
        // The state is two plain integers; a poisoned lock still holds a valid value.
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Result of [`EntryTracker::get_or_create`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedIndex {
    pub index: usize,
    /// `true` when the index was just issued: the caller emits `add`, else `replace`.
    pub is_new: bool,
}

/// Maps correlation keys (tool-call ids, streamed message blocks) to the
/// stable index of the entry they update.
#[derive(Debug, Default)]
pub struct EntryTracker {
    provider: EntryIndexProvider,
    keys: HashMap<String, usize>,
}

impl EntryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_or_create(&mut self, key: &str) -> TrackedIndex {
        if let Some(&index) = self.keys.get(key) {
            return TrackedIndex {
                index,
                is_new: false,
            };
        }
        let index = self.provider.next();
        self.keys.insert(key.to_string(), index);
        TrackedIndex {
            index,
            is_new: true,
        }
    }

    /// Stop correlating `key`. The index itself is never reissued.
    pub fn forget(&mut self, key: &str) -> Option<usize> {
        self.keys.remove(key)
    }

    /// Provider for entries that have no correlation key.
    pub const fn provider(&self) -> &EntryIndexProvider {
        &self.provider
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn next_is_gap_free_and_increasing() {
        let provider = EntryIndexProvider::new();
        let issued: Vec<usize> = (0..10).map(|_| provider.next()).collect();
        assert_eq!(issued, (0..10).collect::<Vec<_>>());
        assert_eq!(provider.current(), 10);
    }

    #[test]
    fn reposition_after_issue_is_ignored() {
        let provider = EntryIndexProvider::new();
        let mut issued = vec![provider.next(), provider.next()];
        provider.reset();
        issued.push(provider.next());
        provider.set_index(1);
        issued.push(provider.next());
        provider.set_index(100);
        issued.push(provider.next());
        assert_eq!(issued, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn fresh_provider_can_be_positioned() {
        let provider = EntryIndexProvider::new();
        provider.set_index(42);
        assert_eq!(provider.next(), 42);
        assert_eq!(EntryIndexProvider::starting_at(7).next(), 7);
    }

    #[test]
    fn concurrent_next_never_repeats() {
        let provider = Arc::new(EntryIndexProvider::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let p = Arc::clone(&provider);
                std::thread::spawn(move || (0..250).map(|_| p.next()).collect::<Vec<_>>())
            })
            .collect();
        let mut all: Vec<usize> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        assert_eq!(all, (0..1000).collect::<Vec<_>>());
    }

    #[test]
    fn tracker_resolves_same_key_to_same_index() {
        let mut tracker = EntryTracker::new();
        let first = tracker.get_or_create("tool:a");
        let untracked = tracker.provider().next();
        let again = tracker.get_or_create("tool:a");
        let other = tracker.get_or_create("tool:b");

        assert!(first.is_new);
        assert!(!again.is_new);
        assert_eq!(first.index, again.index);
        assert_eq!(untracked, 1);
        assert_eq!(other.index, 2);
    }

    #[test]
    fn forgotten_key_gets_fresh_index() {
        let mut tracker = EntryTracker::new();
        let first = tracker.get_or_create("k");
        assert_eq!(tracker.forget("k"), Some(first.index));
        let second = tracker.get_or_create("k");
        assert!(second.is_new);
        assert!(second.index > first.index);
    }
}
