//! Two-tier cache manager.
//!
//! Reads check the memory tier, then the remote store, repopulating memory on
//! a remote hit. Writes go to both tiers and register tag memberships in the
//! remote store. Store and codec failures are counted, logged and turned into
//! misses or no-ops; only producer errors reach the caller.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::StreamExt;
use futures::future::join_all;
use metrics::{counter, histogram};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, instrument, warn};

use super::codec::{Codec, CodecError};
use super::config::CacheConfig;
use super::keys::Namespace;
use super::memory::MemoryTier;
use super::options::{CacheOptions, Expiry, Layer};
use super::stats::{CacheMetrics, CacheStats, HitTier};
use super::store::{RemoteStore, StoreError, StoreStats};

const METRIC_HIT_TOTAL: &str = "clinic_cache_hit_total";
const METRIC_MISS_TOTAL: &str = "clinic_cache_miss_total";
const METRIC_ERROR_TOTAL: &str = "clinic_cache_error_total";
const METRIC_OP_MS: &str = "clinic_cache_op_ms";

const LEASE_MARKER: &[u8] = b"1";

/// Outcome of the stale-while-revalidate decision.
enum Refresh<T> {
    Serve(T),
    Regenerate { leased: bool, stale: Option<T> },
}

pub struct CacheManager {
    namespace: Namespace,
    memory: Arc<MemoryTier>,
    remote: Arc<dyn RemoteStore>,
    codec: Codec,
    stats: CacheStats,
    /// Last successful `remember_forever` regeneration per physical key.
    refreshed_at: DashMap<String, Instant>,
    config: CacheConfig,
}

impl CacheManager {
    pub fn new(
        prefix: impl Into<String>,
        max_memory_bytes: usize,
        remote: Arc<dyn RemoteStore>,
        config: CacheConfig,
    ) -> Self {
        let namespace = Namespace::new(prefix);
        let memory = Arc::new(MemoryTier::new(namespace.prefix(), max_memory_bytes));
        Self {
            codec: config.codec(),
            namespace,
            memory,
            remote,
            stats: CacheStats::new(),
            refreshed_at: DashMap::new(),
            config,
        }
    }

    pub fn prefix(&self) -> &str {
        self.namespace.prefix()
    }

    pub fn memory(&self) -> &Arc<MemoryTier> {
        &self.memory
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look a key up, memory tier first unless the layer restricts it.
    pub async fn get<T: DeserializeOwned>(&self, key: &str, options: &CacheOptions) -> Option<T> {
        let started = Instant::now();
        self.stats.record_operation();

        let found = self.lookup(key, options.layer).await;
        match &found {
            Some((_, tier)) => {
                self.stats.record_hit(*tier);
                counter!(
                    METRIC_HIT_TOTAL,
                    "cache" => self.prefix().to_string(),
                    "tier" => tier.as_str()
                )
                .increment(1);
            }
            None => {
                self.stats.record_miss();
                counter!(METRIC_MISS_TOTAL, "cache" => self.prefix().to_string()).increment(1);
            }
        }

        self.record_timing("get", started);
        found.map(|(value, _)| value)
    }

    async fn lookup<T: DeserializeOwned>(&self, key: &str, layer: Layer) -> Option<(T, HitTier)> {
        let full = self.namespace.key(key);

        if layer.uses_memory()
            && let Some(payload) = self.memory.get(&full)
        {
            match payload.decode() {
                Ok(value) => return Some((value, HitTier::Memory)),
                Err(err) => {
                    self.record_codec_error("get", &err);
                    self.memory.delete(&full);
                }
            }
        }

        if !layer.uses_remote() {
            return None;
        }

        let (envelope, remaining) = match self.remote.get_with_ttl(&full).await {
            Ok(Some(found)) => found,
            Ok(None) => return None,
            Err(err) => {
                self.record_store_error("get", &err);
                return None;
            }
        };

        let decoded = self
            .codec
            .open(&envelope)
            .and_then(|payload| payload.decode().map(|value| (payload, value)));
        let (payload, value) = match decoded {
            Ok(decoded) => decoded,
            Err(err) => {
                self.record_codec_error("get", &err);
                return None;
            }
        };

        if layer.uses_memory() {
            let ttl = self.repopulation_ttl(remaining);
            if !ttl.is_zero() {
                self.memory.set(&full, payload, Some(ttl));
            }
        }
        Some((value, HitTier::Remote))
    }

    /// Memory-tier TTL for a remote hit: never longer than the remote record lives.
    fn repopulation_ttl(&self, remaining: Option<Duration>) -> Duration {
        let default = self.config.default_ttl();
        remaining.map_or(default, |remaining| remaining.min(default))
    }

    /// Write a value to the selected tiers and register its tags.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T, options: &CacheOptions) {
        let started = Instant::now();
        self.stats.record_operation();

        let full = self.namespace.key(key);
        let ttl = self.resolve_ttl(options.expiry);

        let payload = match self.codec.encode(value) {
            Ok(payload) => payload,
            Err(err) => {
                self.record_codec_error("set", &err);
                self.record_timing("set", started);
                return;
            }
        };

        if options.layer.uses_memory() {
            self.memory.set(&full, payload.clone(), ttl);
        }

        if options.layer.uses_remote() {
            match self.codec.seal(&payload) {
                Ok(envelope) => {
                    if let Err(err) = self.remote.set(&full, &envelope, ttl).await {
                        self.record_store_error("set", &err);
                    }
                }
                Err(err) => self.record_codec_error("set", &err),
            }
        }

        if !options.tags.is_empty() {
            self.register_tags(&full, &options.tags).await;
        }

        self.record_timing("set", started);
    }

    async fn register_tags(&self, full_key: &str, tags: &[String]) {
        let member = [full_key.to_string()];
        for tag in tags {
            let tag_key = self.namespace.tag(tag);
            if let Err(err) = self.remote.sadd(&tag_key, &member).await {
                self.record_store_error("sadd", &err);
            }
        }
    }

    /// Remove a key from both tiers.
    pub async fn del(&self, key: &str) {
        self.stats.record_operation();

        let full = self.namespace.key(key);
        self.memory.delete(&full);
        self.refreshed_at.remove(&full);

        if let Err(err) = self.remote.del(&[full]).await {
            self.record_store_error("del", &err);
        }
    }

    /// Delete every key registered under `tag`, then the tag record itself.
    ///
    /// Returns the number of member keys found.
    #[instrument(skip(self), fields(cache = %self.namespace.prefix()))]
    pub async fn invalidate_tag(&self, tag: &str) -> usize {
        self.stats.record_operation();

        let tag_key = self.namespace.tag(tag);
        let members = match self.remote.smembers(&tag_key).await {
            Ok(members) => members,
            Err(err) => {
                self.record_store_error("invalidate_tag", &err);
                return 0;
            }
        };

        for member in &members {
            self.memory.delete(member);
            self.refreshed_at.remove(member);
        }
        for chunk in members.chunks(self.config.clear_batch_size()) {
            if let Err(err) = self.remote.del(chunk).await {
                self.record_store_error("invalidate_tag", &err);
            }
        }
        if let Err(err) = self.remote.del(&[tag_key]).await {
            self.record_store_error("invalidate_tag", &err);
        }

        info!(tag, members = members.len(), "Cache tag invalidated");
        members.len()
    }

    /// Empty the memory tier and delete every remote key under the prefix.
    ///
    /// Returns the number of remote keys deleted.
    #[instrument(skip(self), fields(cache = %self.namespace.prefix()))]
    pub async fn clear(&self) -> u64 {
        self.stats.record_operation();
        self.memory.clear();
        self.refreshed_at.clear();

        let pattern = self.namespace.pattern();
        let batch_size = self.config.clear_batch_size();
        let mut keys = self.remote.scan(&pattern);
        let mut batch = Vec::with_capacity(batch_size);
        let mut removed = 0;

        while let Some(next) = keys.next().await {
            match next {
                Ok(key) => {
                    batch.push(key);
                    if batch.len() >= batch_size {
                        removed += self.delete_batch(&batch).await;
                        batch.clear();
                    }
                }
                Err(err) => {
                    self.record_store_error("clear", &err);
                    break;
                }
            }
        }
        if !batch.is_empty() {
            removed += self.delete_batch(&batch).await;
        }

        info!(removed, "Cache instance cleared");
        removed
    }

    async fn delete_batch(&self, keys: &[String]) -> u64 {
        match self.remote.del(keys).await {
            Ok(count) => count,
            Err(err) => {
                self.record_store_error("clear", &err);
                0
            }
        }
    }

    /// Cache-aside: return the cached value, or produce, store and return it.
    ///
    /// Concurrent misses may each run the producer once.
    pub async fn remember<T, E, F, Fut>(
        &self,
        key: &str,
        options: &CacheOptions,
        producer: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get(key, options).await {
            return Ok(value);
        }

        let value = producer().await?;
        self.set(key, &value, options).await;
        Ok(value)
    }

    /// Stale-while-revalidate.
    ///
    /// Within `refresh` of the last regeneration the cached value is served
    /// as is. Afterwards one caller takes a lease in the remote store and
    /// regenerates while the others keep serving the stale value. When the
    /// producer fails, stale data is returned if any exists.
    pub async fn remember_forever<T, E, F, Fut>(
        &self,
        key: &str,
        refresh: Duration,
        options: &CacheOptions,
        producer: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let full = self.namespace.key(key);
        let lease_key = self.namespace.lease(key);

        let (leased, stale) = match self.plan_refresh(key, &full, &lease_key, refresh, options).await
        {
            Refresh::Serve(value) => return Ok(value),
            Refresh::Regenerate { leased, stale } => (leased, stale),
        };

        let produced = producer().await;

        let outcome = match produced {
            Ok(value) => {
                let write_options = CacheOptions {
                    expiry: match options.expiry {
                        Expiry::After(ttl) => Expiry::After(ttl),
                        Expiry::Default | Expiry::Never => Expiry::Never,
                    },
                    ..options.clone()
                };
                self.set(key, &value, &write_options).await;
                self.refreshed_at.insert(full, Instant::now());
                Ok(value)
            }
            Err(err) => match stale {
                Some(value) => {
                    warn!(
                        cache = %self.prefix(),
                        key,
                        error = %err,
                        "Regeneration failed, serving stale value"
                    );
                    Ok(value)
                }
                None => Err(err),
            },
        };

        if leased && let Err(err) = self.remote.del(&[lease_key]).await {
            self.record_store_error("lease_release", &err);
        }

        outcome
    }

    async fn plan_refresh<T: DeserializeOwned>(
        &self,
        key: &str,
        full: &str,
        lease_key: &str,
        refresh: Duration,
        options: &CacheOptions,
    ) -> Refresh<T> {
        for attempt in 0..2 {
            let fresh = self
                .refreshed_at
                .get(full)
                .is_some_and(|at| at.elapsed() < refresh);
            let cached = self.get(key, options).await;

            if fresh && let Some(value) = cached {
                return Refresh::Serve(value);
            }

            if self.acquire_lease(lease_key).await {
                return Refresh::Regenerate {
                    leased: true,
                    stale: cached,
                };
            }

            if let Some(value) = cached {
                debug!(cache = %self.prefix(), key, "Refresh in progress elsewhere, serving stale value");
                return Refresh::Serve(value);
            }

            if attempt == 0 {
                sleep(self.config.lease_poll).await;
            }
        }

        debug!(cache = %self.prefix(), key, "Lease still busy with nothing cached, producing without it");
        Refresh::Regenerate {
            leased: false,
            stale: None,
        }
    }

    /// A store failure counts as acquired; the lease only approximates exclusion.
    async fn acquire_lease(&self, lease_key: &str) -> bool {
        match self
            .remote
            .set_nx(lease_key, LEASE_MARKER, self.config.lease_ttl)
            .await
        {
            Ok(acquired) => acquired,
            Err(err) => {
                self.record_store_error("lease_acquire", &err);
                true
            }
        }
    }

    /// Fetch several keys; no atomicity across keys.
    pub async fn mget<T: DeserializeOwned>(
        &self,
        keys: &[impl AsRef<str>],
        options: &CacheOptions,
    ) -> Vec<Option<T>> {
        join_all(keys.iter().map(|key| self.get(key.as_ref(), options))).await
    }

    /// Store several entries; no atomicity across keys.
    pub async fn mset<K, T>(&self, entries: &[(K, T)], options: &CacheOptions)
    where
        K: AsRef<str>,
        T: Serialize,
    {
        join_all(
            entries
                .iter()
                .map(|(key, value)| self.set(key.as_ref(), value, options)),
        )
        .await;
    }

    /// Snapshot of this instance's counters and memory footprint.
    pub fn get_metrics(&self) -> CacheMetrics {
        self.stats
            .snapshot(self.memory.used_bytes() as u64, self.memory.len() as u64)
    }

    /// Remote store health, `None` when the store cannot be queried.
    pub async fn store_stats(&self) -> Option<StoreStats> {
        match self.remote.stats().await {
            Ok(stats) => Some(stats),
            Err(err) => {
                self.record_store_error("stats", &err);
                None
            }
        }
    }

    pub async fn ping(&self) -> bool {
        match self.remote.ping().await {
            Ok(()) => true,
            Err(err) => {
                self.record_store_error("ping", &err);
                false
            }
        }
    }

    fn resolve_ttl(&self, expiry: Expiry) -> Option<Duration> {
        match expiry {
            Expiry::Default => Some(self.config.default_ttl()),
            Expiry::After(ttl) => Some(ttl),
            Expiry::Never => None,
        }
    }

    fn record_timing(&self, op: &'static str, started: Instant) {
        let elapsed = started.elapsed();
        self.stats.record_response(elapsed);
        histogram!(METRIC_OP_MS, "cache" => self.prefix().to_string(), "op" => op)
            .record(elapsed.as_secs_f64() * 1000.0);
    }

    fn record_store_error(&self, op: &'static str, err: &StoreError) {
        self.stats.record_error();
        counter!(METRIC_ERROR_TOTAL, "cache" => self.prefix().to_string(), "op" => op)
            .increment(1);
        warn!(
            cache = %self.prefix(),
            op,
            transient = err.is_transient(),
            error = %err,
            "Remote store operation failed"
        );
    }

    fn record_codec_error(&self, op: &'static str, err: &CodecError) {
        self.stats.record_error();
        counter!(METRIC_ERROR_TOTAL, "cache" => self.prefix().to_string(), "op" => op)
            .increment(1);
        warn!(
            cache = %self.prefix(),
            op,
            error = %err,
            "Cache value could not be encoded or decoded"
        );
    }
}
