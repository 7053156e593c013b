//! Two-tier consistency against the in-process store and a store that is down.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use clinic_cache::cache::store::KeyStream;
use clinic_cache::cache::{
    CacheConfig, CacheManager, CacheName, CacheOptions, CacheRegistry, InMemoryStore, Layer,
    RemoteStore, StoreError, StoreStats,
};
use futures::stream;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Patient {
    name: String,
}

fn ana() -> Patient {
    Patient {
        name: "Ana".to_string(),
    }
}

/// Every call fails as if the server were unreachable.
#[derive(Debug, Default)]
struct FailingStore {
    calls: AtomicUsize,
}

impl FailingStore {
    fn fail<T>(&self) -> Result<T, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(StoreError::unavailable("connection refused"))
    }
}

#[async_trait]
impl RemoteStore for FailingStore {
    fn backend(&self) -> &'static str {
        "failing"
    }

    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.fail()
    }

    async fn get_with_ttl(
        &self,
        _key: &str,
    ) -> Result<Option<(Vec<u8>, Option<Duration>)>, StoreError> {
        self.fail()
    }

    async fn set(&self, _key: &str, _value: &[u8], _ttl: Option<Duration>) -> Result<(), StoreError> {
        self.fail()
    }

    async fn set_nx(&self, _key: &str, _value: &[u8], _ttl: Duration) -> Result<bool, StoreError> {
        self.fail()
    }

    async fn del(&self, _keys: &[String]) -> Result<u64, StoreError> {
        self.fail()
    }

    async fn exists(&self, _key: &str) -> Result<bool, StoreError> {
        self.fail()
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool, StoreError> {
        self.fail()
    }

    async fn sadd(&self, _key: &str, _members: &[String]) -> Result<u64, StoreError> {
        self.fail()
    }

    async fn smembers(&self, _key: &str) -> Result<Vec<String>, StoreError> {
        self.fail()
    }

    fn scan<'a>(&'a self, _pattern: &'a str) -> KeyStream<'a> {
        Box::pin(stream::iter([self.fail::<String>()]))
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.fail()
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        self.fail()
    }
}

fn patients_cache(store: Arc<dyn RemoteStore>) -> CacheManager {
    CacheManager::new("patients", 1024 * 1024, store, CacheConfig::default())
}

#[tokio::test]
async fn patient_lifecycle_end_to_end() {
    let store = Arc::new(InMemoryStore::new());
    let cache = patients_cache(store.clone());
    let options = CacheOptions::new()
        .ttl(Duration::from_secs(300))
        .tag("patients");

    cache.set("patient:42", &ana(), &options).await;

    let cached: Option<Patient> = cache.get("patient:42", &CacheOptions::new()).await;
    assert_eq!(cached, Some(ana()));
    assert_eq!(cache.get_metrics().memory_hits, 1);

    assert_eq!(cache.invalidate_tag("patients").await, 1);

    let gone: Option<Patient> = cache.get("patient:42", &CacheOptions::new()).await;
    assert!(gone.is_none());
    let remote_only: Option<Patient> = cache
        .get("patient:42", &CacheOptions::new().layer(Layer::Remote))
        .await;
    assert!(remote_only.is_none());
    assert!(store.get("patients:patient:42").await.expect("get").is_none());
}

#[tokio::test]
async fn tag_invalidation_removes_every_member_and_the_tag_set() {
    let store = Arc::new(InMemoryStore::new());
    let cache = patients_cache(store.clone());

    cache
        .set("patient:1", &1u32, &CacheOptions::new().tags(["ward:a", "active"]))
        .await;
    cache
        .set("patient:2", &2u32, &CacheOptions::new().tag("ward:a"))
        .await;
    cache.set("patient:3", &3u32, &CacheOptions::new()).await;

    assert_eq!(cache.invalidate_tag("ward:a").await, 2);

    let options = CacheOptions::new();
    assert!(cache.get::<u32>("patient:1", &options).await.is_none());
    assert!(cache.get::<u32>("patient:2", &options).await.is_none());
    assert_eq!(cache.get::<u32>("patient:3", &options).await, Some(3));
    assert!(
        store
            .smembers("patients:tag:ward:a")
            .await
            .expect("smembers")
            .is_empty()
    );
    assert!(!store.exists("patients:tag:ward:a").await.expect("exists"));

    // The other tag still lists the deleted key; invalidating it is harmless.
    assert_eq!(cache.invalidate_tag("active").await, 1);
}

#[tokio::test(start_paused = true)]
async fn entries_expire_in_both_tiers() {
    let store = Arc::new(InMemoryStore::new());
    let cache = patients_cache(store.clone());
    cache
        .set("visit", &"today", &CacheOptions::new().ttl(Duration::from_secs(10)))
        .await;

    tokio::time::advance(Duration::from_secs(9)).await;
    assert_eq!(
        cache.get::<String>("visit", &CacheOptions::new()).await,
        Some("today".to_string())
    );

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(cache.get::<String>("visit", &CacheOptions::new()).await.is_none());
    assert!(!store.exists("patients:visit").await.expect("exists"));
}

#[tokio::test(start_paused = true)]
async fn remote_hits_never_outlive_the_remote_ttl() {
    let store = Arc::new(InMemoryStore::new());
    let writer = patients_cache(store.clone());
    let reader = patients_cache(store.clone());
    writer
        .set("visit", &"today", &CacheOptions::new().ttl(Duration::from_secs(10)))
        .await;

    tokio::time::advance(Duration::from_secs(1)).await;
    assert_eq!(
        reader.get::<String>("visit", &CacheOptions::new()).await,
        Some("today".to_string())
    );

    tokio::time::advance(Duration::from_secs(5)).await;
    assert_eq!(
        reader.get::<String>("visit", &CacheOptions::new()).await,
        Some("today".to_string())
    );
    assert_eq!(reader.get_metrics().memory_hits, 1);

    tokio::time::advance(Duration::from_secs(14)).await;
    assert!(!store.exists("patients:visit").await.expect("exists"));
    assert!(reader.get::<String>("visit", &CacheOptions::new()).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn remote_only_writes_repopulate_memory_with_the_remaining_ttl() {
    let cache = patients_cache(Arc::new(InMemoryStore::new()));
    cache
        .set(
            "slot",
            &"09:30",
            &CacheOptions::new()
                .layer(Layer::Remote)
                .ttl(Duration::from_secs(10)),
        )
        .await;

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(cache.get::<String>("slot", &CacheOptions::new()).await.is_some());

    tokio::time::advance(Duration::from_secs(9)).await;
    assert!(
        cache
            .get::<String>("slot", &CacheOptions::new().layer(Layer::Memory))
            .await
            .is_none()
    );
    assert!(cache.get::<String>("slot", &CacheOptions::new()).await.is_none());
}

#[tokio::test]
async fn memory_pressure_evicts_soonest_expiring_first() {
    let store = Arc::new(InMemoryStore::new());
    // Room for two 40-character strings, not three.
    let cache = CacheManager::new("reports", 100, store, CacheConfig::default());
    let blob = |ch: char| ch.to_string().repeat(40);
    let memory_only = |ttl: u64| {
        CacheOptions::new()
            .layer(Layer::Memory)
            .ttl(Duration::from_secs(ttl))
    };

    cache.set("late", &blob('a'), &memory_only(600)).await;
    cache.set("soon", &blob('b'), &memory_only(60)).await;
    cache.set("new", &blob('c'), &memory_only(300)).await;

    let layer = CacheOptions::new().layer(Layer::Memory);
    assert!(cache.get::<String>("soon", &layer).await.is_none());
    assert_eq!(cache.get::<String>("late", &layer).await, Some(blob('a')));
    assert_eq!(cache.get::<String>("new", &layer).await, Some(blob('c')));
}

#[tokio::test]
async fn remember_skips_the_producer_on_hit() {
    let cache = patients_cache(Arc::new(InMemoryStore::new()));
    let calls = AtomicUsize::new(0);

    for _ in 0..3 {
        let patient = cache
            .remember("patient:7", &CacheOptions::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok::<_, std::io::Error>(ana())
            })
            .await
            .expect("producer succeeds");
        assert_eq!(patient, ana());
    }

    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn hit_rate_tracks_hits_and_misses() {
    let cache = patients_cache(Arc::new(InMemoryStore::new()));
    cache.set("present", &1u32, &CacheOptions::new()).await;

    for _ in 0..3 {
        let _: Option<u32> = cache.get("present", &CacheOptions::new()).await;
    }
    let _: Option<u32> = cache.get("absent", &CacheOptions::new()).await;

    let metrics = cache.get_metrics();
    assert_eq!(metrics.hits, 3);
    assert_eq!(metrics.misses, 1);
    assert_eq!(metrics.hit_rate, 75.0);
    assert_eq!(metrics.operations, 5);
}

#[tokio::test]
async fn unavailable_store_degrades_to_memory_only() {
    let store = Arc::new(FailingStore::default());
    let cache = patients_cache(store.clone());

    cache
        .set("patient:42", &ana(), &CacheOptions::new().tag("patients"))
        .await;
    let cached: Option<Patient> = cache.get("patient:42", &CacheOptions::new()).await;
    assert_eq!(cached, Some(ana()));

    let missing: Option<Patient> = cache.get("patient:43", &CacheOptions::new()).await;
    assert!(missing.is_none());

    assert_eq!(cache.invalidate_tag("patients").await, 0);
    cache.del("patient:42").await;
    assert_eq!(cache.clear().await, 0);
    assert!(!cache.ping().await);
    assert!(cache.store_stats().await.is_none());

    let metrics = cache.get_metrics();
    assert!(metrics.errors >= 6, "errors: {}", metrics.errors);
    assert!(store.calls.load(Ordering::SeqCst) >= 6);
}

#[tokio::test]
async fn producer_still_runs_when_the_store_is_down() {
    let cache = patients_cache(Arc::new(FailingStore::default()));

    let value = cache
        .remember_forever(
            "stats",
            Duration::from_secs(60),
            &CacheOptions::new(),
            || async { Ok::<_, String>(12u32) },
        )
        .await;
    assert_eq!(value, Ok(12));
}

#[tokio::test]
async fn registry_instances_share_one_store_under_their_prefixes() {
    let store = Arc::new(InMemoryStore::new());
    let registry = CacheRegistry::new(&CacheConfig::default(), store.clone());

    for (name, cache) in registry.iter() {
        cache.set("shared", &name.as_str(), &CacheOptions::new()).await;
    }
    assert_eq!(store.len(), CacheName::ALL.len());

    registry.get(CacheName::Sessions).clear().await;
    assert_eq!(store.len(), CacheName::ALL.len() - 1);
    assert_eq!(
        registry
            .get(CacheName::Reports)
            .get::<String>("shared", &CacheOptions::new().layer(Layer::Remote))
            .await,
        Some("reports".to_string())
    );
}
