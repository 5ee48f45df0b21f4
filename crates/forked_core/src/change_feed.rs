//! Change feed for observing committed fork updates and merges.
//!
//! The change feed emits one event per committed update or merge, enabling:
//! - Sync adapters to notice local edits of `main`
//! - Reactive UI updates
//!
//! # Usage
//!
//! ```rust,ignore
//! let store = ForkedStore::<String>::new();
//! let mut changes = store.subscribe();
//!
//! tokio::spawn(async move {
//!     while let Some(event) = changes.next().await {
//!         println!("{} changed (merging {:?})", event.fork, event.merging_fork);
//!     }
//! });
//! ```
//!
//! A stream only sees events committed after it subscribed.

use crate::fork::Fork;
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

/// A single change event from the change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Fork whose head moved.
    pub fork: Fork,
    /// Fork that was merged into `fork`, or `None` for a direct update.
    pub merging_fork: Option<Fork>,
}

impl ChangeEvent {
    /// Creates an event for a direct update of `fork`.
    pub fn update(fork: Fork) -> Self {
        Self {
            fork,
            merging_fork: None,
        }
    }

    /// Creates an event for a merge of `merging_fork` into `fork`.
    pub fn merge(fork: Fork, merging_fork: Fork) -> Self {
        Self {
            fork,
            merging_fork: Some(merging_fork),
        }
    }
}

/// A change feed that distributes committed changes to subscribers.
///
/// The change feed:
/// - Emits only committed changes
/// - Preserves commit order
/// - Supports multiple subscribers
/// - Is thread-safe
pub struct ChangeFeed {
    subscribers: RwLock<Vec<UnboundedSender<ChangeEvent>>>,
}

impl ChangeFeed {
    /// Creates a new change feed.
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Subscribes to the change feed.
    ///
    /// Returns a stream of all future change events.
    pub fn subscribe(&self) -> ChangeStream {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.write().push(tx);
        ChangeStream { receiver: rx }
    }

    /// Emits a change event to all subscribers.
    pub fn emit(&self, event: ChangeEvent) {
        // Send to subscribers (remove disconnected ones)
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Emits multiple events from a single commit.
    pub fn emit_batch(&self, events: Vec<ChangeEvent>) {
        for event in events {
            self.emit(event);
        }
    }

    /// Returns the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// An ordered, possibly infinite stream of change events.
///
/// Dropping the stream unsubscribes it on the next emit.
pub struct ChangeStream {
    receiver: UnboundedReceiver<ChangeEvent>,
}

impl ChangeStream {
    /// Waits for the next event. Returns `None` once the feed is gone.
    pub async fn next(&mut self) -> Option<ChangeEvent> {
        self.receiver.recv().await
    }

    /// Returns the next event if one is already queued.
    pub fn try_next(&mut self) -> Option<ChangeEvent> {
        self.receiver.try_recv().ok()
    }
}
