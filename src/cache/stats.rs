//! Per-instance counters and the rolling response-time window.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::lock;

const SOURCE: &str = "cache::stats";

/// Number of most recent timed operations the average is computed over.
pub const RESPONSE_WINDOW: usize = 1000;

/// Tier that served a hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitTier {
    Memory,
    Remote,
}

impl HitTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Remote => "remote",
        }
    }
}

/// Point-in-time metrics for one cache instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub memory_hits: u64,
    pub remote_hits: u64,
    pub operations: u64,
    pub errors: u64,
    /// `hits / (hits + misses) * 100`, zero before the first lookup.
    pub hit_rate: f64,
    pub avg_response_time_ms: f64,
    pub memory_bytes: u64,
    pub memory_entries: u64,
}

#[derive(Debug, Default)]
struct ResponseWindow {
    samples: VecDeque<f64>,
    sum: f64,
}

impl ResponseWindow {
    fn push(&mut self, millis: f64) {
        if self.samples.len() == RESPONSE_WINDOW
            && let Some(oldest) = self.samples.pop_front()
        {
            self.sum -= oldest;
        }
        self.samples.push_back(millis);
        self.sum += millis;
    }

    fn average(&self) -> f64 {
        if self.samples.is_empty() {
            0.0
        } else {
            (self.sum / self.samples.len() as f64).max(0.0)
        }
    }
}

/// Monotonic counters, reset only when the process restarts.
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    memory_hits: AtomicU64,
    remote_hits: AtomicU64,
    operations: AtomicU64,
    errors: AtomicU64,
    window: Mutex<ResponseWindow>,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_operation(&self) {
        self.operations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_hit(&self, tier: HitTier) {
        self.hits.fetch_add(1, Ordering::Relaxed);
        match tier {
            HitTier::Memory => self.memory_hits.fetch_add(1, Ordering::Relaxed),
            HitTier::Remote => self.remote_hits.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_response(&self, elapsed: Duration) {
        lock::lock(&self.window, SOURCE, "record_response").push(elapsed.as_secs_f64() * 1000.0);
    }

    /// Snapshot the counters; derived rates are computed at read time.
    pub fn snapshot(&self, memory_bytes: u64, memory_entries: u64) -> CacheMetrics {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        let hit_rate = if lookups == 0 {
            0.0
        } else {
            hits as f64 / lookups as f64 * 100.0
        };

        CacheMetrics {
            hits,
            misses,
            memory_hits: self.memory_hits.load(Ordering::Relaxed),
            remote_hits: self.remote_hits.load(Ordering::Relaxed),
            operations: self.operations.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            hit_rate,
            avg_response_time_ms: lock::lock(&self.window, SOURCE, "snapshot").average(),
            memory_bytes,
            memory_entries,
        }
    }
}
