use std::collections::HashSet;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use clinic_cache::cache::{
    CacheConfig, CacheName, CacheOptions, CacheRegistry, Encoding, InMemoryStore,
    InvalidationConsumer, InvalidationKind, InvalidationQueue, MemoryTier, Payload, RemoteStore,
};
use clinic_cache::config::MonitorSettings;
use clinic_cache::monitor::{AlertThresholds, CacheMonitor};
use metrics_util::debugging::DebuggingRecorder;

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    // Hits, misses, store/codec errors and per-op timings
    let store = Arc::new(InMemoryStore::new());
    let config = CacheConfig::default();
    let registry = Arc::new(CacheRegistry::new(&config, store.clone()));
    let patients = registry.get(CacheName::Patients);

    patients
        .set("patient:1", &"Ana", &CacheOptions::new())
        .await;
    assert!(
        patients
            .get::<String>("patient:1", &CacheOptions::new())
            .await
            .is_some()
    );
    for _ in 0..3 {
        assert!(
            patients
                .get::<String>("patient:404", &CacheOptions::new())
                .await
                .is_none()
        );
    }
    store
        .set("patients:broken", b"garbage", None)
        .await
        .expect("raw write");
    assert!(
        patients
            .get::<String>("broken", &CacheOptions::new())
            .await
            .is_none()
    );

    // Memory tier eviction
    let tiny = MemoryTier::new("tiny", 8);
    assert!(tiny.set("a", Payload::new(Encoding::Json, &b"\"aaaa\""[..]), None));
    assert!(tiny.set("b", Payload::new(Encoding::Json, &b"\"bbbb\""[..]), None));
    assert!(tiny.get("a").is_none());

    // Queue length and drops
    let bounded = InvalidationQueue::new(1);
    bounded.publish(InvalidationKind::Clear {
        cache: CacheName::Sessions,
    });
    bounded.publish(InvalidationKind::Clear {
        cache: CacheName::Sessions,
    });
    assert_eq!(bounded.len(), 1);

    // Consumer latency
    let queue = Arc::new(InvalidationQueue::new(config.queue_limit));
    let consumer = InvalidationConsumer::new(config.clone(), registry.clone(), queue.clone());
    queue.publish(InvalidationKind::Key {
        cache: CacheName::Patients,
        key: "patient:1".to_string(),
    });
    assert!(consumer.consume().await);

    // Monitor gauges and a raised alert (hit rate is below 50%)
    let settings = MonitorSettings {
        interval: Duration::from_secs(60),
        history_limit: NonZeroUsize::new(10).expect("non-zero"),
        thresholds: AlertThresholds::default(),
    };
    let monitor = CacheMonitor::new(registry, queue, &settings);
    monitor.poll();
    assert!(!monitor.active_alerts().is_empty());

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "clinic_cache_hit_total",
        "clinic_cache_miss_total",
        "clinic_cache_error_total",
        "clinic_cache_evict_total",
        "clinic_cache_op_ms",
        "clinic_cache_invalidation_queue_len",
        "clinic_cache_invalidation_dropped_total",
        "clinic_cache_consume_ms",
        "clinic_cache_health_score",
        "clinic_cache_alerts_active",
        "clinic_cache_alert_fired_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
