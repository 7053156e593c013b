//! Cache configuration.
//!
//! Resolved from the `[cache]` section of the settings; `Default` mirrors the
//! built-in defaults so tests and embedders can construct managers directly.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::TtlSettings;

use super::codec::{Codec, DEFAULT_COMPRESSION_THRESHOLD, Encoding};
use super::options::TtlTier;
use super::registry::CacheName;

const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_LEASE_TTL_SECS: u64 = 30;
const DEFAULT_LEASE_POLL_MS: u64 = 100;
const DEFAULT_CLEAR_BATCH_SIZE: usize = 100;
const DEFAULT_QUEUE_LIMIT: usize = 10_000;
const DEFAULT_CONSUME_BATCH_LIMIT: usize = 500;
const DEFAULT_CONSUME_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub encoding: Encoding,
    /// Payloads above this many bytes are compressed in the remote tier.
    pub compression_threshold: usize,
    pub ttl: TtlSettings,
    pub sweep_interval: Duration,
    /// Memory budget overrides in bytes.
    pub budgets: BTreeMap<CacheName, usize>,
    /// Lifetime of the `remember_forever` refresh lease.
    pub lease_ttl: Duration,
    /// Wait before re-checking a busy lease when nothing stale exists.
    pub lease_poll: Duration,
    /// Keys per remote `DEL` during clears and tag invalidation.
    pub clear_batch_size: usize,
    /// Pending invalidation events kept before the oldest are dropped.
    pub queue_limit: usize,
    pub consume_batch_limit: usize,
    pub consume_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            encoding: Encoding::default(),
            compression_threshold: DEFAULT_COMPRESSION_THRESHOLD,
            ttl: TtlSettings::default(),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            budgets: BTreeMap::new(),
            lease_ttl: Duration::from_secs(DEFAULT_LEASE_TTL_SECS),
            lease_poll: Duration::from_millis(DEFAULT_LEASE_POLL_MS),
            clear_batch_size: DEFAULT_CLEAR_BATCH_SIZE,
            queue_limit: DEFAULT_QUEUE_LIMIT,
            consume_batch_limit: DEFAULT_CONSUME_BATCH_LIMIT,
            consume_interval: Duration::from_millis(DEFAULT_CONSUME_INTERVAL_MS),
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            encoding: settings.encoding,
            compression_threshold: settings.compression_threshold_bytes,
            ttl: settings.ttl,
            sweep_interval: settings.sweep_interval,
            budgets: settings.budgets.clone(),
            lease_ttl: settings.lease_ttl,
            lease_poll: settings.lease_poll,
            clear_batch_size: settings.clear_batch_size.get(),
            queue_limit: settings.invalidation.queue_limit.get(),
            consume_batch_limit: settings.invalidation.batch_limit.get(),
            consume_interval: settings.invalidation.consume_interval,
        }
    }
}

impl CacheConfig {
    /// Memory budget for a named instance, honouring overrides.
    pub fn budget(&self, name: CacheName) -> usize {
        self.budgets
            .get(&name)
            .copied()
            .unwrap_or_else(|| name.default_budget())
    }

    pub fn ttl(&self, tier: TtlTier) -> Duration {
        self.ttl.get(tier)
    }

    pub fn default_ttl(&self) -> Duration {
        self.ttl.medium
    }

    pub fn codec(&self) -> Codec {
        Codec::new(self.encoding).with_compression_threshold(self.compression_threshold)
    }

    /// Batch size clamped to at least one key.
    pub fn clear_batch_size(&self) -> usize {
        self.clear_batch_size.max(1)
    }
}
