//! Invalidation events.
//!
//! Write paths publish events here; the consumer drains and applies them.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use metrics::{counter, gauge};
use time::OffsetDateTime;
use tracing::{debug, warn};
use uuid::Uuid;

use super::lock;
use super::registry::CacheName;

const SOURCE: &str = "cache::events";

const METRIC_QUEUE_LEN: &str = "clinic_cache_invalidation_queue_len";
const METRIC_DROPPED_TOTAL: &str = "clinic_cache_invalidation_dropped_total";

/// Monotonic ordering of events within this process.
pub type Epoch = u64;

#[derive(Debug, Clone)]
pub struct InvalidationEvent {
    pub id: Uuid,
    pub epoch: Epoch,
    pub kind: InvalidationKind,
    pub timestamp: OffsetDateTime,
}

impl InvalidationEvent {
    pub fn new(kind: InvalidationKind, epoch: Epoch) -> Self {
        Self {
            id: Uuid::new_v4(),
            epoch,
            kind,
            timestamp: OffsetDateTime::now_utc(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InvalidationKind {
    /// Drop one logical key from an instance.
    Key { cache: CacheName, key: String },
    /// Drop every key registered under a tag.
    Tag { cache: CacheName, tag: String },
    /// Empty an instance.
    Clear { cache: CacheName },
}

impl InvalidationKind {
    pub fn cache(&self) -> CacheName {
        match self {
            Self::Key { cache, .. } | Self::Tag { cache, .. } | Self::Clear { cache } => *cache,
        }
    }
}

/// Bounded FIFO of pending invalidations.
///
/// When full, the oldest events are dropped and counted.
pub struct InvalidationQueue {
    queue: Mutex<VecDeque<InvalidationEvent>>,
    epoch_counter: AtomicU64,
    limit: usize,
}

impl InvalidationQueue {
    pub fn new(limit: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            epoch_counter: AtomicU64::new(0),
            limit: limit.max(1),
        }
    }

    pub fn next_epoch(&self) -> Epoch {
        self.epoch_counter.fetch_add(1, Ordering::SeqCst)
    }

    pub fn publish(&self, kind: InvalidationKind) {
        let event = InvalidationEvent::new(kind, self.next_epoch());
        debug!(
            event_id = %event.id,
            event_epoch = event.epoch,
            event_kind = ?event.kind,
            "Invalidation event enqueued"
        );

        let mut queue = lock::lock(&self.queue, SOURCE, "publish");
        queue.push_back(event);

        let overflow = queue.len().saturating_sub(self.limit);
        if overflow > 0 {
            queue.drain(..overflow);
            counter!(METRIC_DROPPED_TOTAL).increment(overflow as u64);
            warn!(
                dropped = overflow,
                limit = self.limit,
                "Invalidation queue full, oldest events dropped"
            );
        }
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
    }

    /// Remove up to `limit` events in FIFO order.
    pub fn drain(&self, limit: usize) -> Vec<InvalidationEvent> {
        let mut queue = lock::lock(&self.queue, SOURCE, "drain");
        let count = limit.min(queue.len());
        let events = queue.drain(..count).collect();
        gauge!(METRIC_QUEUE_LEN).set(queue.len() as f64);
        events
    }

    pub fn len(&self) -> usize {
        lock::lock(&self.queue, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        lock::lock(&self.queue, SOURCE, "clear").clear();
        gauge!(METRIC_QUEUE_LEN).set(0.0);
    }
}
