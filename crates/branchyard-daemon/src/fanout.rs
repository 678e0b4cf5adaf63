//! Synchronous event fan-out to live subscribers.
//!
//! Owners keep a [`Subscribers`] set inside the same lock that guards the state
//! the events describe, so every subscriber sees event `n` before anyone sees
//! event `n + 1`. A sink that fails is logged and dropped; the remaining sinks
//! still receive the event.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Why a sink refused an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    #[error("sink closed")]
    Closed,

    #[error("sink full")]
    Full,

    #[error("{0}")]
    Other(String),
}

/// Receiver side of a subscription.
///
/// `deliver` runs under the publisher's lock and must not block.
pub trait EventSink<E>: Send + Sync {
    fn deliver(&self, event: &E) -> Result<(), SinkError>;
}

impl<E: Clone + Send> EventSink<E> for mpsc::UnboundedSender<E> {
    fn deliver(&self, event: &E) -> Result<(), SinkError> {
        self.send(event.clone()).map_err(|_| SinkError::Closed)
    }
}

impl<E: Clone + Send> EventSink<E> for mpsc::Sender<E> {
    fn deliver(&self, event: &E) -> Result<(), SinkError> {
        self.try_send(event.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SinkError::Full,
            mpsc::error::TrySendError::Closed(_) => SinkError::Closed,
        })
    }
}

/// Subscriber set owned by a publisher.
pub struct Subscribers<E> {
    sinks: BTreeMap<u64, Arc<dyn EventSink<E>>>,
    next_id: u64,
}

impl<E> Default for Subscribers<E> {
    fn default() -> Self {
        Self {
            sinks: BTreeMap::new(),
            next_id: 0,
        }
    }
}

impl<E> fmt::Debug for Subscribers<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscribers")
            .field("count", &self.sinks.len())
            .finish()
    }
}

impl<E> Subscribers<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink; the returned id is used to remove it.
    pub fn add(&mut self, sink: Arc<dyn EventSink<E>>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.sinks.insert(id, sink);
        id
    }

    pub fn remove(&mut self, id: u64) -> bool {
        self.sinks.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }

    pub fn clear(&mut self) {
        self.sinks.clear();
    }

    /// Deliver `event` to every sink in subscription order.
    ///
    /// Returns the number of sinks that accepted it. `owner` only labels logs.
    pub fn broadcast(&mut self, owner: &str, event: &E) -> usize {
        let mut failed = Vec::new();
        for (id, sink) in &self.sinks {
            if let Err(e) = sink.deliver(event) {
                failed.push((*id, e));
            }
        }
        for (id, error) in &failed {
            self.sinks.remove(id);
            warn!(owner, subscriber = id, %error, "Dropping failed subscriber");
        }
        let delivered = self.sinks.len();
        debug!(owner, delivered, "Event broadcast");
        delivered
    }
}

/// Live registration with a publisher. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    /// `cancel` removes subscriber `id` from its publisher.
    pub fn new(id: u64, cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            id,
            cancel: Some(Box::new(cancel)),
        }
    }

    pub const fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(mut self) {
        self.cancel_now();
    }

    fn cancel_now(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_now();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Broken;

    impl EventSink<u32> for Broken {
        fn deliver(&self, _event: &u32) -> Result<(), SinkError> {
            Err(SinkError::Other("socket reset".into()))
        }
    }

    #[test]
    fn broken_sink_does_not_block_others() {
        let mut subs = Subscribers::new();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();
        subs.add(Arc::new(tx_a));
        subs.add(Arc::new(Broken));
        subs.add(Arc::new(tx_b));

        assert_eq!(subs.broadcast("test", &7), 2);
        assert_eq!(subs.len(), 2);
        assert_eq!(rx_a.try_recv().unwrap(), 7);
        assert_eq!(rx_b.try_recv().unwrap(), 7);
    }

    #[test]
    fn closed_receiver_is_pruned() {
        let mut subs = Subscribers::new();
        let (tx, rx) = mpsc::unbounded_channel::<u32>();
        subs.add(Arc::new(tx));
        drop(rx);
        assert_eq!(subs.broadcast("test", &1), 0);
        assert!(subs.is_empty());
    }

    #[test]
    fn full_bounded_sink_is_dropped() {
        let mut subs = Subscribers::new();
        let (tx, mut rx) = mpsc::channel::<u32>(1);
        subs.add(Arc::new(tx));
        assert_eq!(subs.broadcast("test", &1), 1);
        assert_eq!(subs.broadcast("test", &2), 0);
        assert_eq!(rx.try_recv().unwrap(), 1);
    }

    #[test]
    fn dropping_subscription_runs_cancel_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let sub = Subscription::new(3, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(sub.id(), 3);
        sub.unsubscribe();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscription_removes_itself_from_shared_set() {
        let set: Arc<Mutex<Subscribers<u32>>> = Arc::new(Mutex::new(Subscribers::new()));
        let (tx, _rx) = mpsc::unbounded_channel::<u32>();
        let id = set.lock().unwrap().add(Arc::new(tx));
        let weak = Arc::downgrade(&set);
        let sub = Subscription::new(id, move || {
            if let Some(set) = weak.upgrade() {
                set.lock().unwrap().remove(id);
            }
        });
        assert_eq!(set.lock().unwrap().len(), 1);
        drop(sub);
        assert!(set.lock().unwrap().is_empty());
    }
}
