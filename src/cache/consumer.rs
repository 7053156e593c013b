//! Invalidation consumer.
//!
//! Drains the queue, plans and applies the invalidations to the registry.

use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use super::config::CacheConfig;
use super::events::InvalidationQueue;
use super::planner::{InstancePlan, InvalidationPlan};
use super::registry::{CacheName, CacheRegistry};

const METRIC_CONSUME_MS: &str = "clinic_cache_consume_ms";

pub struct InvalidationConsumer {
    config: CacheConfig,
    registry: Arc<CacheRegistry>,
    queue: Arc<InvalidationQueue>,
}

impl InvalidationConsumer {
    pub fn new(
        config: CacheConfig,
        registry: Arc<CacheRegistry>,
        queue: Arc<InvalidationQueue>,
    ) -> Self {
        Self {
            config,
            registry,
            queue,
        }
    }

    /// Consume one batch of pending events.
    ///
    /// Returns true if any events were processed.
    #[instrument(skip(self))]
    pub async fn consume(&self) -> bool {
        let started_at = Instant::now();
        let events = self.queue.drain(self.config.consume_batch_limit);
        if events.is_empty() {
            return false;
        }

        let event_count = events.len();
        let event_ids: Vec<Uuid> = events.iter().map(|event| event.id).collect();
        let plan = InvalidationPlan::from_events(events);

        debug!(
            event_count,
            event_ids = ?event_ids,
            plan = %plan,
            "Invalidation consumption starting"
        );

        for (name, instance) in &plan.instances {
            self.apply(*name, instance).await;
        }

        info!(
            event_count,
            actions = plan.action_count(),
            "Invalidation consumption complete"
        );
        histogram!(METRIC_CONSUME_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);

        true
    }

    /// Consume until the queue is empty.
    pub async fn consume_all(&self) -> usize {
        let mut batches = 0;
        while self.consume().await {
            batches += 1;
        }
        batches
    }

    async fn apply(&self, name: CacheName, plan: &InstancePlan) {
        let cache = self.registry.get(name);

        if plan.clear {
            cache.clear().await;
            return;
        }
        for key in &plan.keys {
            cache.del(key).await;
        }
        for tag in &plan.tags {
            cache.invalidate_tag(tag).await;
        }
    }

    pub fn queue(&self) -> &Arc<InvalidationQueue> {
        &self.queue
    }

    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.registry
    }
}

/// Run the consumer on the configured cadence until aborted.
pub fn spawn_consumer(consumer: Arc<InvalidationConsumer>) -> JoinHandle<()> {
    let every = consumer.config.consume_interval;
    tokio::spawn(async move {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            consumer.consume_all().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::events::InvalidationKind;
    use crate::cache::options::CacheOptions;
    use crate::cache::store::InMemoryStore;

    fn consumer_with(config: CacheConfig) -> InvalidationConsumer {
        let registry = Arc::new(CacheRegistry::new(&config, Arc::new(InMemoryStore::new())));
        let queue = Arc::new(InvalidationQueue::new(config.queue_limit));
        InvalidationConsumer::new(config, registry, queue)
    }

    #[tokio::test]
    async fn empty_queue_returns_false() {
        let consumer = consumer_with(CacheConfig::default());
        assert!(!consumer.consume().await);
    }

    #[tokio::test]
    async fn key_and_tag_events_reach_the_instance() {
        let consumer = consumer_with(CacheConfig::default());
        let patients = consumer.registry().get(CacheName::Patients).clone();
        patients.set("patient:1", &1u32, &CacheOptions::new()).await;
        patients
            .set("patient:2", &2u32, &CacheOptions::new().tag("ward:a"))
            .await;
        patients.set("patient:3", &3u32, &CacheOptions::new()).await;

        consumer.queue().publish(InvalidationKind::Key {
            cache: CacheName::Patients,
            key: "patient:1".to_string(),
        });
        consumer.queue().publish(InvalidationKind::Tag {
            cache: CacheName::Patients,
            tag: "ward:a".to_string(),
        });

        assert!(consumer.consume().await);
        assert!(consumer.queue().is_empty());

        let options = CacheOptions::new();
        assert!(patients.get::<u32>("patient:1", &options).await.is_none());
        assert!(patients.get::<u32>("patient:2", &options).await.is_none());
        assert_eq!(patients.get::<u32>("patient:3", &options).await, Some(3));
    }

    #[tokio::test]
    async fn consume_respects_batch_limit() {
        let config = CacheConfig {
            consume_batch_limit: 2,
            ..Default::default()
        };
        let consumer = consumer_with(config);
        for i in 0..5 {
            consumer.queue().publish(InvalidationKind::Key {
                cache: CacheName::Sessions,
                key: format!("session:{i}"),
            });
        }

        assert!(consumer.consume().await);
        assert_eq!(consumer.queue().len(), 3);

        assert_eq!(consumer.consume_all().await, 2);
        assert!(consumer.queue().is_empty());
    }

    #[tokio::test]
    async fn clear_event_empties_only_its_instance() {
        let consumer = consumer_with(CacheConfig::default());
        let reports = consumer.registry().get(CacheName::Reports).clone();
        let analytics = consumer.registry().get(CacheName::Analytics).clone();
        reports.set("a", &1u32, &CacheOptions::new()).await;
        analytics.set("a", &1u32, &CacheOptions::new()).await;

        consumer.queue().publish(InvalidationKind::Clear {
            cache: CacheName::Reports,
        });
        consumer.consume().await;

        assert!(reports.memory().is_empty());
        assert_eq!(analytics.get::<u32>("a", &CacheOptions::new()).await, Some(1));
    }
}
