use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use tokio::time::Instant;

use crate::cache::lock;

use super::{KeyStream, RemoteStore, StoreError, StoreStats, glob_matches};

const SOURCE: &str = "cache::store::memory";

/// Writes between full sweeps of expired records.
const PURGE_EVERY_WRITES: u64 = 1024;

#[derive(Debug, Clone)]
enum Record {
    Bytes(Vec<u8>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Slot {
    record: Record,
    expires_at: Option<Instant>,
}

impl Slot {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// In-process stand-in for the remote store.
///
/// Mirrors the networked store's semantics: string and set records share one
/// keyspace, TTLs are checked lazily on access, and type mismatches are
/// rejected the way the server rejects them. Expired records nobody reads
/// again are reclaimed by periodic sweeps during writes, scans and stats.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    slots: RwLock<HashMap<String, Slot>>,
    writes: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live records, expired ones excluded.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        lock::read(&self.slots, SOURCE, "len")
            .values()
            .filter(|slot| !slot.is_expired(now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every expired record, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut slots = lock::write(&self.slots, SOURCE, "purge_expired");
        let before = slots.len();
        slots.retain(|_, slot| !slot.is_expired(now));
        before - slots.len()
    }

    fn maybe_purge(&self) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % PURGE_EVERY_WRITES == 0 {
            self.purge_expired();
        }
    }

    fn purge_if_expired(slots: &mut HashMap<String, Slot>, key: &str, now: Instant) {
        if slots.get(key).is_some_and(|slot| slot.is_expired(now)) {
            slots.remove(key);
        }
    }
}

fn wrong_type(op: &'static str) -> StoreError {
    StoreError::command(
        op,
        "WRONGTYPE Operation against a key holding the wrong kind of value",
    )
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let now = Instant::now();
        let mut slots = lock::write(&self.slots, SOURCE, "get");
        Self::purge_if_expired(&mut slots, key, now);

        match slots.get(key).map(|slot| &slot.record) {
            None => Ok(None),
            Some(Record::Bytes(bytes)) => Ok(Some(bytes.clone())),
            Some(Record::Set(_)) => Err(wrong_type("GET")),
        }
    }

    async fn get_with_ttl(
        &self,
        key: &str,
    ) -> Result<Option<(Vec<u8>, Option<Duration>)>, StoreError> {
        let now = Instant::now();
        let mut slots = lock::write(&self.slots, SOURCE, "get_with_ttl");
        Self::purge_if_expired(&mut slots, key, now);

        match slots.get(key) {
            None => Ok(None),
            Some(Slot {
                record: Record::Bytes(bytes),
                expires_at,
            }) => Ok(Some((
                bytes.clone(),
                expires_at.map(|at| at.saturating_duration_since(now)),
            ))),
            Some(_) => Err(wrong_type("GET")),
        }
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.maybe_purge();
        lock::write(&self.slots, SOURCE, "set").insert(
            key.to_string(),
            Slot {
                record: Record::Bytes(value.to_vec()),
                expires_at,
            },
        );
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        self.maybe_purge();
        let mut slots = lock::write(&self.slots, SOURCE, "set_nx");
        Self::purge_if_expired(&mut slots, key, now);

        if slots.contains_key(key) {
            return Ok(false);
        }
        slots.insert(
            key.to_string(),
            Slot {
                record: Record::Bytes(value.to_vec()),
                expires_at: Some(now + ttl),
            },
        );
        Ok(true)
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        let now = Instant::now();
        let mut slots = lock::write(&self.slots, SOURCE, "del");

        let mut removed = 0;
        for key in keys {
            if let Some(slot) = slots.remove(key)
                && !slot.is_expired(now)
            {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        let now = Instant::now();
        Ok(lock::read(&self.slots, SOURCE, "exists")
            .get(key)
            .is_some_and(|slot| !slot.is_expired(now)))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        let now = Instant::now();
        let mut slots = lock::write(&self.slots, SOURCE, "expire");
        Self::purge_if_expired(&mut slots, key, now);

        match slots.get_mut(key) {
            Some(slot) => {
                slot.expires_at = Some(now + ttl);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        let now = Instant::now();
        self.maybe_purge();
        let mut slots = lock::write(&self.slots, SOURCE, "sadd");
        Self::purge_if_expired(&mut slots, key, now);

        let slot = slots.entry(key.to_string()).or_insert_with(|| Slot {
            record: Record::Set(HashSet::new()),
            expires_at: None,
        });
        let Record::Set(set) = &mut slot.record else {
            return Err(wrong_type("SADD"));
        };

        let added = members
            .iter()
            .filter(|member| set.insert((*member).clone()))
            .count();
        Ok(added as u64)
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        let now = Instant::now();
        let mut slots = lock::write(&self.slots, SOURCE, "smembers");
        Self::purge_if_expired(&mut slots, key, now);

        match slots.get(key).map(|slot| &slot.record) {
            None => Ok(Vec::new()),
            Some(Record::Set(set)) => Ok(set.iter().cloned().collect()),
            Some(Record::Bytes(_)) => Err(wrong_type("SMEMBERS")),
        }
    }

    fn scan<'a>(&'a self, pattern: &'a str) -> KeyStream<'a> {
        self.purge_expired();
        let keys: Vec<Result<String, StoreError>> = lock::read(&self.slots, SOURCE, "scan")
            .iter()
            .filter(|(key, _)| glob_matches(pattern, key))
            .map(|(key, _)| Ok(key.clone()))
            .collect();
        Box::pin(stream::iter(keys))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.purge_expired();
        Ok(StoreStats {
            backend: self.backend(),
            endpoint: None,
            key_count: self.len() as u64,
            used_memory_bytes: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use futures::TryStreamExt;

    use super::*;

    fn keys(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[tokio::test]
    async fn set_get_and_delete() {
        let store = InMemoryStore::new();

        store.set("k", b"v", None).await.expect("set");
        assert_eq!(store.get("k").await.expect("get"), Some(b"v".to_vec()));
        assert!(store.exists("k").await.expect("exists"));

        let removed = store.del(&keys(&["k", "missing"])).await.expect("del");
        assert_eq!(removed, 1);
        assert_eq!(store.get("k").await.expect("get"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_is_enforced_lazily_on_read() {
        let store = InMemoryStore::new();
        store
            .set("k", b"v", Some(Duration::from_secs(10)))
            .await
            .expect("set");

        tokio::time::advance(Duration::from_millis(9_900)).await;
        assert!(store.get("k").await.expect("get").is_some());

        tokio::time::advance(Duration::from_millis(200)).await;
        assert!(store.get("k").await.expect("get").is_none());
        assert!(!store.exists("k").await.expect("exists"));
    }

    fn slot_count(store: &InMemoryStore) -> usize {
        lock::read(&store.slots, SOURCE, "slot_count").len()
    }

    #[tokio::test(start_paused = true)]
    async fn expired_records_are_reclaimed_without_being_read() {
        let store = InMemoryStore::new();
        for i in 0..10_000 {
            store
                .set(&format!("visit:{i}"), b"v", Some(Duration::from_secs(1)))
                .await
                .expect("set");
        }

        tokio::time::advance(Duration::from_secs(5)).await;
        store.set("other", b"v", None).await.expect("set");

        let stats = store.stats().await.expect("stats");
        assert_eq!(stats.key_count, 1);
        assert_eq!(slot_count(&store), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn writes_alone_eventually_sweep_expired_records() {
        let store = InMemoryStore::new();
        for i in 0..10 {
            store
                .set(&format!("session:{i}"), b"v", Some(Duration::from_secs(1)))
                .await
                .expect("set");
        }

        tokio::time::advance(Duration::from_secs(2)).await;
        for i in 0..PURGE_EVERY_WRITES {
            store.set(&format!("live:{i}"), b"v", None).await.expect("set");
        }

        assert_eq!(slot_count(&store), PURGE_EVERY_WRITES as usize);
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_ttl_is_read_with_the_value() {
        let store = InMemoryStore::new();
        store
            .set("k", b"v", Some(Duration::from_secs(10)))
            .await
            .expect("set");
        store.set("forever", b"v", None).await.expect("set");

        tokio::time::advance(Duration::from_secs(4)).await;
        assert_eq!(
            store.get_with_ttl("k").await.expect("get"),
            Some((b"v".to_vec(), Some(Duration::from_secs(6))))
        );
        assert_eq!(
            store.get_with_ttl("forever").await.expect("get"),
            Some((b"v".to_vec(), None))
        );
        assert_eq!(store.get_with_ttl("missing").await.expect("get"), None);
    }

    #[tokio::test(start_paused = true)]
    async fn expire_applies_to_existing_keys_only() {
        let store = InMemoryStore::new();
        store.set("k", b"v", None).await.expect("set");

        assert!(store.expire("k", Duration::from_secs(1)).await.expect("expire"));
        assert!(!store.expire("nope", Duration::from_secs(1)).await.expect("expire"));

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(store.get("k").await.expect("get").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn set_nx_acts_as_a_lease() {
        let store = InMemoryStore::new();
        let ttl = Duration::from_secs(30);

        assert!(store.set_nx("lock", b"1", ttl).await.expect("first"));
        assert!(!store.set_nx("lock", b"1", ttl).await.expect("second"));

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(store.set_nx("lock", b"1", ttl).await.expect("after expiry"));
    }

    #[tokio::test]
    async fn set_membership_counts_new_members() {
        let store = InMemoryStore::new();

        let added = store
            .sadd("tag:patients", &keys(&["a", "b"]))
            .await
            .expect("sadd");
        assert_eq!(added, 2);

        let added = store
            .sadd("tag:patients", &keys(&["b", "c"]))
            .await
            .expect("sadd");
        assert_eq!(added, 1);

        let mut members = store.smembers("tag:patients").await.expect("smembers");
        members.sort();
        assert_eq!(members, keys(&["a", "b", "c"]));

        assert!(store.smembers("tag:none").await.expect("smembers").is_empty());
    }

    #[tokio::test]
    async fn mixing_record_kinds_is_rejected() {
        let store = InMemoryStore::new();
        store.set("k", b"v", None).await.expect("set");
        store.sadd("s", &keys(&["m"])).await.expect("sadd");

        assert!(store.sadd("k", &keys(&["m"])).await.is_err());
        assert!(store.get("s").await.is_err());
        assert!(store.smembers("k").await.is_err());
    }

    #[tokio::test]
    async fn scan_filters_by_glob() {
        let store = InMemoryStore::new();
        for key in ["patients:1", "patients:2", "reports:1"] {
            store.set(key, b"v", None).await.expect("set");
        }
        store
            .sadd("patients:tag:vip", &keys(&["patients:1"]))
            .await
            .expect("sadd");

        let mut found: Vec<String> = store
            .scan("patients:*")
            .try_collect()
            .await
            .expect("scan");
        found.sort();

        assert_eq!(
            found,
            keys(&["patients:1", "patients:2", "patients:tag:vip"])
        );
    }
}
