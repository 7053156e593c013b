//! Combined metrics across all cache instances.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;

use crate::cache::{CacheMetrics, CacheName};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OverallMetrics {
    pub hits: u64,
    pub misses: u64,
    pub operations: u64,
    pub errors: u64,
    pub hit_rate: f64,
    /// `errors / operations * 100`.
    pub error_rate: f64,
    /// Mean of the per-instance averages, over instances that saw traffic.
    pub avg_response_time_ms: f64,
    pub memory_bytes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct InvalidationMetrics {
    /// Events waiting in the invalidation queue.
    pub backlog: u64,
}

/// One monitor sample. Alert rules address its fields by dotted path
/// using the serialized names, e.g. `overall.hitRate`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSummary {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub overall: OverallMetrics,
    pub caches: BTreeMap<CacheName, CacheMetrics>,
    pub invalidation: InvalidationMetrics,
}

impl MetricsSummary {
    pub fn from_instances(
        timestamp: OffsetDateTime,
        instances: impl IntoIterator<Item = (CacheName, CacheMetrics)>,
        backlog: u64,
    ) -> Self {
        let caches: BTreeMap<_, _> = instances.into_iter().collect();

        let mut overall = OverallMetrics::default();
        let mut timed = 0usize;
        let mut response_sum = 0.0;
        for metrics in caches.values() {
            overall.hits += metrics.hits;
            overall.misses += metrics.misses;
            overall.operations += metrics.operations;
            overall.errors += metrics.errors;
            overall.memory_bytes += metrics.memory_bytes;
            if metrics.operations > 0 {
                timed += 1;
                response_sum += metrics.avg_response_time_ms;
            }
        }

        overall.hit_rate = percentage(overall.hits, overall.hits + overall.misses);
        overall.error_rate = percentage(overall.errors, overall.operations);
        if timed > 0 {
            overall.avg_response_time_ms = response_sum / timed as f64;
        }

        Self {
            timestamp,
            overall,
            caches,
            invalidation: InvalidationMetrics { backlog },
        }
    }

    /// Resolve a dotted metric path to a number.
    ///
    /// A `hitRate` whose scope has seen no lookups resolves to `None`, so
    /// idle instances are not mistaken for ones that only miss.
    pub fn lookup(&self, path: &str) -> Option<f64> {
        let root = serde_json::to_value(self).ok()?;
        let (scope, field) = match path.rsplit_once('.') {
            Some((scope, field)) => (resolve(&root, scope)?, field),
            None => (&root, path),
        };

        if field == "hitRate" && lookups(scope) == Some(0) {
            return None;
        }
        scope.get(field).and_then(Value::as_f64)
    }
}

fn resolve<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .try_fold(root, |node, segment| node.get(segment))
}

fn lookups(scope: &Value) -> Option<u64> {
    let count = |field: &str| scope.get(field).and_then(Value::as_u64);
    Some(count("hits")? + count("misses")?)
}

fn percentage(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}
