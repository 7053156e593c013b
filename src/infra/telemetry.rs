use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register units and help text with whichever recorder is installed.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "clinic_cache_hit_total",
            Unit::Count,
            "Cache hits by instance and serving tier."
        );
        describe_counter!(
            "clinic_cache_miss_total",
            Unit::Count,
            "Cache misses by instance."
        );
        describe_counter!(
            "clinic_cache_error_total",
            Unit::Count,
            "Remote store and codec failures absorbed by the cache, by operation."
        );
        describe_counter!(
            "clinic_cache_evict_total",
            Unit::Count,
            "Memory tier entries evicted to make room."
        );
        describe_histogram!(
            "clinic_cache_op_ms",
            Unit::Milliseconds,
            "Cache get/set latency in milliseconds."
        );
        describe_gauge!(
            "clinic_cache_invalidation_queue_len",
            Unit::Count,
            "Pending invalidation events."
        );
        describe_counter!(
            "clinic_cache_invalidation_dropped_total",
            Unit::Count,
            "Invalidation events dropped due to queue overflow."
        );
        describe_histogram!(
            "clinic_cache_consume_ms",
            Unit::Milliseconds,
            "Invalidation consumer pass latency in milliseconds."
        );
        describe_gauge!(
            "clinic_cache_health_score",
            Unit::Count,
            "Derived cache health score between 0 and 100."
        );
        describe_gauge!(
            "clinic_cache_alerts_active",
            Unit::Count,
            "Currently unresolved cache alerts."
        );
        describe_counter!(
            "clinic_cache_alert_fired_total",
            Unit::Count,
            "Alerts raised by rule and severity."
        );
    });
}
