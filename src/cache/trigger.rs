//! Invalidation trigger.
//!
//! Entry point for data-access code after a successful write: publishes the
//! invalidations an entity change implies and optionally applies them at once.

use std::fmt::Display;
use std::sync::Arc;

use time::Date;

use super::consumer::InvalidationConsumer;
use super::events::{InvalidationKind, InvalidationQueue};
use super::keys;
use super::registry::CacheName;

/// Tag carried by cached patient listings and searches.
pub const PATIENT_LISTS_TAG: &str = "patients";
/// Tag carried by cached appointment aggregates.
pub const APPOINTMENT_STATS_TAG: &str = "appointments";

pub struct CacheTrigger {
    queue: Arc<InvalidationQueue>,
    consumer: Arc<InvalidationConsumer>,
}

impl CacheTrigger {
    pub fn new(queue: Arc<InvalidationQueue>, consumer: Arc<InvalidationConsumer>) -> Self {
        Self { queue, consumer }
    }

    /// Publish one event; with `consume_now` the queue is drained before returning.
    pub async fn trigger(&self, kind: InvalidationKind, consume_now: bool) {
        self.queue.publish(kind);
        if consume_now {
            self.consumer.consume_all().await;
        }
    }

    async fn trigger_all(&self, kinds: impl IntoIterator<Item = InvalidationKind>) {
        for kind in kinds {
            self.queue.publish(kind);
        }
        self.consumer.consume_all().await;
    }

    pub async fn key_changed(&self, cache: CacheName, key: impl Into<String>) {
        self.trigger(
            InvalidationKind::Key {
                cache,
                key: key.into(),
            },
            true,
        )
        .await;
    }

    pub async fn tag_changed(&self, cache: CacheName, tag: impl Into<String>) {
        self.trigger(
            InvalidationKind::Tag {
                cache,
                tag: tag.into(),
            },
            true,
        )
        .await;
    }

    pub async fn clear(&self, cache: CacheName) {
        self.trigger(InvalidationKind::Clear { cache }, true).await;
    }

    /// A patient record was created, updated or deleted.
    pub async fn patient_changed(&self, id: impl Display) {
        self.trigger_all([
            InvalidationKind::Key {
                cache: CacheName::Patients,
                key: keys::patient(id),
            },
            InvalidationKind::Tag {
                cache: CacheName::Queries,
                tag: PATIENT_LISTS_TAG.to_string(),
            },
        ])
        .await;
    }

    /// An appointment changed; `day` is its scheduled date.
    pub async fn appointment_changed(&self, id: impl Display, day: Date) {
        self.trigger_all([
            InvalidationKind::Key {
                cache: CacheName::Appointments,
                key: keys::appointment(id),
            },
            InvalidationKind::Key {
                cache: CacheName::Appointments,
                key: keys::appointments_daily(day),
            },
            InvalidationKind::Tag {
                cache: CacheName::Analytics,
                tag: APPOINTMENT_STATS_TAG.to_string(),
            },
        ])
        .await;
    }

    /// A generated report is outdated, together with every report of its kind.
    pub async fn report_changed(&self, kind: &str, id: impl Display) {
        self.trigger_all([
            InvalidationKind::Key {
                cache: CacheName::Reports,
                key: keys::report(kind, id),
            },
            InvalidationKind::Tag {
                cache: CacheName::Reports,
                tag: kind.to_string(),
            },
        ])
        .await;
    }

    pub fn queue(&self) -> &Arc<InvalidationQueue> {
        &self.queue
    }

    pub fn consumer(&self) -> &Arc<InvalidationConsumer> {
        &self.consumer
    }
}
