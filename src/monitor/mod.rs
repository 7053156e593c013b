//! Metrics aggregation and alerting across the cache registry.
//!
//! [`CacheMonitor`] samples every instance on a timer, keeps a bounded history
//! of [`MetricsSummary`] values and feeds each one to the [`AlertEngine`].

mod alerts;
mod summary;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::gauge;
use serde::Serialize;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tracing::{debug, instrument};

use crate::cache::lock;
use crate::cache::{CacheRegistry, InvalidationQueue};
use crate::config::MonitorSettings;

pub use alerts::{
    Alert, AlertEngine, AlertPage, AlertRule, AlertThresholds, Direction, Severity, default_rules,
};
pub use summary::{InvalidationMetrics, MetricsSummary, OverallMetrics};

const SOURCE: &str = "monitor";

const METRIC_HEALTH_SCORE: &str = "clinic_cache_health_score";
const METRIC_ALERTS_ACTIVE: &str = "clinic_cache_alerts_active";

/// Response time at or below which the latency component scores in full.
const RESPONSE_BASELINE_MS: f64 = 50.0;
/// Error rate, in percent, at which the error component reaches zero.
const ERROR_RATE_CEILING: f64 = 10.0;
const ALERT_PENALTY: f64 = 2.5;

/// Derived 0..=100 health score.
///
/// Hit rate weighs 40, response time 30, error rate 20 and active alerts 10.
/// A sample without lookups scores the hit-rate component in full.
pub fn health_score(summary: &MetricsSummary, active_alerts: usize) -> f64 {
    let overall = &summary.overall;

    let hit = if overall.hits + overall.misses == 0 {
        40.0
    } else {
        (overall.hit_rate / 100.0).clamp(0.0, 1.0) * 40.0
    };
    let latency = if overall.avg_response_time_ms <= RESPONSE_BASELINE_MS {
        30.0
    } else {
        30.0 * RESPONSE_BASELINE_MS / overall.avg_response_time_ms
    };
    let errors = (1.0 - overall.error_rate / ERROR_RATE_CEILING).clamp(0.0, 1.0) * 20.0;
    let alerts = (10.0 - ALERT_PENALTY * active_alerts as f64).max(0.0);

    (hit + latency + errors + alerts).clamp(0.0, 100.0)
}

/// Start of a look-back window, clamped to the epoch when it falls outside
/// the representable range.
fn window_start(now: OffsetDateTime, window: time::Duration) -> OffsetDateTime {
    now.checked_sub(window).unwrap_or(OffsetDateTime::UNIX_EPOCH)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceReport {
    pub period_hours: u32,
    pub samples: usize,
    pub avg_hit_rate: f64,
    pub avg_response_time_ms: f64,
    pub peak_response_time_ms: f64,
    /// Growth of the cumulative counters across the window.
    pub operations: u64,
    pub errors: u64,
    pub alerts_raised: usize,
    pub active_alerts: usize,
    pub health_score: f64,
    pub recommendations: Vec<String>,
}

pub struct CacheMonitor {
    registry: Arc<CacheRegistry>,
    queue: Arc<InvalidationQueue>,
    interval: Duration,
    history_limit: usize,
    thresholds: AlertThresholds,
    history: Mutex<VecDeque<MetricsSummary>>,
    engine: Mutex<AlertEngine>,
}

impl CacheMonitor {
    pub fn new(
        registry: Arc<CacheRegistry>,
        queue: Arc<InvalidationQueue>,
        settings: &MonitorSettings,
    ) -> Self {
        Self {
            registry,
            queue,
            interval: settings.interval,
            history_limit: settings.history_limit.get(),
            engine: Mutex::new(AlertEngine::new(default_rules(&settings.thresholds))),
            thresholds: settings.thresholds.clone(),
            history: Mutex::new(VecDeque::new()),
        }
    }

    /// Summarize every instance without recording the sample.
    pub fn collect(&self) -> MetricsSummary {
        MetricsSummary::from_instances(
            OffsetDateTime::now_utc(),
            self.registry
                .iter()
                .map(|(name, cache)| (name, cache.get_metrics())),
            self.queue.len() as u64,
        )
    }

    /// Collect and record one sample.
    #[instrument(skip(self))]
    pub fn poll(&self) -> MetricsSummary {
        let summary = self.collect();
        self.record(summary.clone());
        summary
    }

    /// Append a sample to the history and evaluate the rules against it.
    ///
    /// Returns the alerts it raised.
    pub fn record(&self, summary: MetricsSummary) -> Vec<Alert> {
        let (raised, active) = {
            let mut engine = lock::lock(&self.engine, SOURCE, "record");
            let raised = engine.evaluate(&summary);
            (raised, engine.active_count())
        };

        let score = health_score(&summary, active);
        gauge!(METRIC_HEALTH_SCORE).set(score);
        gauge!(METRIC_ALERTS_ACTIVE).set(active as f64);
        debug!(
            hit_rate = summary.overall.hit_rate,
            operations = summary.overall.operations,
            active_alerts = active,
            health_score = score,
            "Cache metrics sampled"
        );

        let mut history = lock::lock(&self.history, SOURCE, "record");
        history.push_back(summary);
        while history.len() > self.history_limit {
            history.pop_front();
        }

        raised
    }

    /// Latest recorded sample.
    pub fn current_metrics(&self) -> Option<MetricsSummary> {
        lock::lock(&self.history, SOURCE, "current_metrics")
            .back()
            .cloned()
    }

    /// Samples taken within `window` of now, oldest first.
    pub fn history(&self, window: Duration) -> Vec<MetricsSummary> {
        let window = time::Duration::try_from(window).unwrap_or(time::Duration::MAX);
        self.history_since(window_start(OffsetDateTime::now_utc(), window))
    }

    fn history_since(&self, since: OffsetDateTime) -> Vec<MetricsSummary> {
        lock::lock(&self.history, SOURCE, "history")
            .iter()
            .filter(|summary| summary.timestamp >= since)
            .cloned()
            .collect()
    }

    pub fn active_alerts(&self) -> Vec<Alert> {
        lock::lock(&self.engine, SOURCE, "active_alerts").active()
    }

    /// Every alert, newest first. `page` starts at 1.
    pub fn alerts(&self, page: usize, per_page: usize) -> AlertPage {
        lock::lock(&self.engine, SOURCE, "alerts").page(page, per_page)
    }

    /// Health of the latest sample, or of a fresh one before the first poll.
    pub fn health_score(&self) -> f64 {
        let summary = self.current_metrics().unwrap_or_else(|| self.collect());
        let active = lock::lock(&self.engine, SOURCE, "health_score").active_count();
        health_score(&summary, active)
    }

    pub fn rules(&self) -> Vec<AlertRule> {
        lock::lock(&self.engine, SOURCE, "rules").rules().to_vec()
    }

    pub fn add_rule(&self, rule: AlertRule) {
        lock::lock(&self.engine, SOURCE, "add_rule").add_rule(rule);
    }

    pub fn remove_rules(&self, metric: &str) -> usize {
        lock::lock(&self.engine, SOURCE, "remove_rules")
            .remove_rules(metric, OffsetDateTime::now_utc())
    }

    pub fn set_rule_enabled(&self, metric: &str, enabled: bool) -> usize {
        lock::lock(&self.engine, SOURCE, "set_rule_enabled").set_enabled(metric, enabled)
    }

    /// Summary of the last `hours` of samples.
    pub fn performance_report(&self, hours: u32) -> PerformanceReport {
        let since = window_start(
            OffsetDateTime::now_utc(),
            time::Duration::hours(i64::from(hours)),
        );
        let samples = self.history_since(since);
        let (alerts_raised, active_alerts) = {
            let engine = lock::lock(&self.engine, SOURCE, "performance_report");
            (engine.raised_since(since).len(), engine.active_count())
        };

        let count = samples.len();
        let mean = |value: fn(&MetricsSummary) -> f64| {
            if count == 0 {
                0.0
            } else {
                samples.iter().map(value).sum::<f64>() / count as f64
            }
        };
        let avg_hit_rate = mean(|summary| summary.overall.hit_rate);
        let avg_response_time_ms = mean(|summary| summary.overall.avg_response_time_ms);
        let peak_response_time_ms = samples
            .iter()
            .map(|summary| summary.overall.avg_response_time_ms)
            .fold(0.0, f64::max);

        let (operations, errors) = match (samples.first(), samples.last()) {
            (Some(first), Some(last)) if count > 1 => (
                last.overall.operations.saturating_sub(first.overall.operations),
                last.overall.errors.saturating_sub(first.overall.errors),
            ),
            (_, Some(only)) => (only.overall.operations, only.overall.errors),
            _ => (0, 0),
        };

        let mut report = PerformanceReport {
            period_hours: hours,
            samples: count,
            avg_hit_rate,
            avg_response_time_ms,
            peak_response_time_ms,
            operations,
            errors,
            alerts_raised,
            active_alerts,
            health_score: self.health_score(),
            recommendations: Vec::new(),
        };
        report.recommendations = self.recommendations(&report);
        report
    }

    fn recommendations(&self, report: &PerformanceReport) -> Vec<String> {
        let mut advice = Vec::new();
        if report.samples == 0 {
            return advice;
        }

        if report.avg_hit_rate < self.thresholds.hit_rate_warning {
            advice.push(format!(
                "Hit rate averaged {:.1}%; lengthen TTLs or warm frequently missed keys",
                report.avg_hit_rate
            ));
        }
        if report.avg_response_time_ms > self.thresholds.avg_response_time_ms {
            advice.push(format!(
                "Average response time was {:.1}ms; check remote store latency and payload sizes",
                report.avg_response_time_ms
            ));
        }
        if report.operations > 0 {
            let error_rate = report.errors as f64 / report.operations as f64 * 100.0;
            if error_rate > self.thresholds.error_rate {
                advice.push(format!(
                    "Error rate was {error_rate:.1}%; check remote store connectivity"
                ));
            }
        }
        if report.active_alerts > 0 {
            advice.push(format!(
                "{} alert(s) still active; review them before tuning further",
                report.active_alerts
            ));
        }
        advice
    }

    /// Poll on the configured interval until aborted.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.poll();
            }
        })
    }
}
