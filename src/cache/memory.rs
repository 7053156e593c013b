//! Bounded in-process memory tier.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use metrics::counter;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, warn};

use super::codec::Payload;
use super::lock;

const SOURCE: &str = "cache::memory";
const METRIC_EVICT_TOTAL: &str = "clinic_cache_evict_total";

#[derive(Debug, Clone)]
struct CacheEntry {
    value: Payload,
    expires_at: Option<Instant>,
    size_bytes: usize,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Debug, Default)]
struct TierState {
    entries: HashMap<String, CacheEntry>,
    used_bytes: usize,
}

impl TierState {
    fn remove(&mut self, key: &str) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.used_bytes = self.used_bytes.saturating_sub(entry.size_bytes);
        Some(entry)
    }

    /// Evict soonest-expiring entries until `needed` more bytes fit.
    /// Entries without expiry go last.
    fn make_room(&mut self, needed: usize, max_bytes: usize) -> usize {
        if self.used_bytes + needed <= max_bytes {
            return 0;
        }

        let mut order: Vec<(bool, Option<Instant>, String)> = self
            .entries
            .iter()
            .map(|(key, entry)| (entry.expires_at.is_none(), entry.expires_at, key.clone()))
            .collect();
        order.sort();

        let mut evicted = 0;
        for (_, _, key) in order {
            if self.used_bytes + needed <= max_bytes {
                break;
            }
            if self.remove(&key).is_some() {
                evicted += 1;
            }
        }
        evicted
    }
}

/// Byte-budgeted key/value map with per-entry expiry.
///
/// Sizes are charged by payload length. Absence is never an error.
#[derive(Debug)]
pub struct MemoryTier {
    name: String,
    max_bytes: usize,
    state: RwLock<TierState>,
}

impl MemoryTier {
    pub fn new(name: impl Into<String>, max_bytes: usize) -> Self {
        Self {
            name: name.into(),
            max_bytes,
            state: RwLock::new(TierState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn max_bytes(&self) -> usize {
        self.max_bytes
    }

    pub fn get(&self, key: &str) -> Option<Payload> {
        let now = Instant::now();
        {
            let state = lock::read(&self.state, SOURCE, "get");
            match state.entries.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }

        let mut state = lock::write(&self.state, SOURCE, "get.expire");
        if state.entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            state.remove(key);
        }
        None
    }

    /// Insert or replace an entry, evicting by ascending expiry to fit the budget.
    ///
    /// Returns false when the value alone exceeds the whole budget and was not stored.
    pub fn set(&self, key: &str, value: Payload, ttl: Option<Duration>) -> bool {
        let size_bytes = value.len();
        let mut state = lock::write(&self.state, SOURCE, "set");
        state.remove(key);

        if size_bytes > self.max_bytes {
            warn!(
                cache = %self.name,
                key,
                size_bytes,
                max_bytes = self.max_bytes,
                "Value larger than the memory budget, skipping memory tier"
            );
            return false;
        }

        let evicted = state.make_room(size_bytes, self.max_bytes);
        if evicted > 0 {
            debug!(cache = %self.name, evicted, "Evicted entries to fit the memory budget");
            counter!(METRIC_EVICT_TOTAL, "cache" => self.name.clone()).increment(evicted as u64);
        }

        state.used_bytes += size_bytes;
        state.entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
                size_bytes,
            },
        );
        true
    }

    pub fn delete(&self, key: &str) -> bool {
        lock::write(&self.state, SOURCE, "delete").remove(key).is_some()
    }

    pub fn clear(&self) {
        let mut state = lock::write(&self.state, SOURCE, "clear");
        state.entries.clear();
        state.used_bytes = 0;
    }

    /// Remove every expired entry. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let mut state = lock::write(&self.state, SOURCE, "sweep_expired");
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        expired.len()
    }

    pub fn len(&self) -> usize {
        lock::read(&self.state, SOURCE, "len").entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used_bytes(&self) -> usize {
        lock::read(&self.state, SOURCE, "used_bytes").used_bytes
    }
}

/// Sweep `tier` on a fixed interval until the returned task is aborted.
pub fn spawn_sweeper(tier: Arc<MemoryTier>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let removed = tier.sweep_expired();
            if removed > 0 {
                debug!(cache = %tier.name(), removed, "Swept expired memory entries");
            }
        }
    })
}
