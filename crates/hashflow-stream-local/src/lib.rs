//! Local in-memory change feed using per-subscriber channels.
//!
//! Subscribers poll for events instead of holding an async stream. Each queue is
//! bounded; a full queue drops the event for that subscriber only.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};

use hashflow_engine::{ChangeEvent, ChangeKind, ChangeNotifier, HashflowError, Result};
use parking_lot::Mutex;
use tracing::debug;

/// Default per-subscriber queue depth.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

pub type FeedHandle = u64;

struct Subscriber {
    kinds: Vec<ChangeKind>,
    sender: SyncSender<ChangeEvent>,
    receiver: Receiver<ChangeEvent>,
}

impl Subscriber {
    fn wants(&self, kind: ChangeKind) -> bool {
        self.kinds.is_empty() || self.kinds.contains(&kind)
    }
}

/// In-process fan-out of [`ChangeEvent`]s with poll semantics.
pub struct LocalChangeFeed {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<FeedHandle, Subscriber>>,
}

impl LocalChangeFeed {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Register a subscriber. An empty `kinds` list receives every event.
    pub fn subscribe(&self, kinds: Vec<ChangeKind>) -> FeedHandle {
        let (sender, receiver) = mpsc::sync_channel(self.capacity);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut subscribers = self.subscribers.lock();
        subscribers.insert(
            id,
            Subscriber {
                kinds,
                sender,
                receiver,
            },
        );
        #[cfg(feature = "metrics")]
        hashflow_metrics::record_feed_subscribers(subscribers.len());
        debug!(handle = id, "change feed subscriber added");
        id
    }

    /// Next queued event, or `None` when the queue is empty.
    pub fn poll(&self, handle: FeedHandle) -> Result<Option<ChangeEvent>> {
        let subscribers = self.subscribers.lock();
        let sub = subscribers
            .get(&handle)
            .ok_or_else(|| HashflowError::NotFound(format!("subscription {handle}")))?;
        match sub.receiver.try_recv() {
            Ok(event) => Ok(Some(event)),
            Err(mpsc::TryRecvError::Empty) | Err(mpsc::TryRecvError::Disconnected) => Ok(None),
        }
    }

    /// Drain up to `max` queued events.
    pub fn drain(&self, handle: FeedHandle, max: usize) -> Result<Vec<ChangeEvent>> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.poll(handle)? {
                Some(event) => out.push(event),
                None => break,
            }
        }
        Ok(out)
    }

    pub fn stop(&self, handle: FeedHandle) -> bool {
        let mut subscribers = self.subscribers.lock();
        let removed = subscribers.remove(&handle).is_some();
        #[cfg(feature = "metrics")]
        hashflow_metrics::record_feed_subscribers(subscribers.len());
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for LocalChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ChangeNotifier for LocalChangeFeed {
    fn publish(&self, event: &ChangeEvent) -> Result<()> {
        let kind = event.kind();
        let subscribers = self.subscribers.lock();
        let dropped = subscribers
            .iter()
            .filter(|(_, sub)| sub.wants(kind))
            .filter(|(id, sub)| match sub.sender.try_send(event.clone()) {
                Err(TrySendError::Full(_)) => {
                    debug!(handle = id, ?kind, "subscriber queue full; event dropped");
                    true
                }
                Ok(()) | Err(TrySendError::Disconnected(_)) => false,
            })
            .count();
        if dropped > 0 {
            #[cfg(feature = "metrics")]
            hashflow_metrics::record_feed_dropped(dropped as u64);
        }
        Ok(())
    }
}
