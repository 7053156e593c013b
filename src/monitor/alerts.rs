//! Threshold alert rules and their lifecycle.
//!
//! A rule in breach raises one alert; further breaches leave it untouched
//! until the rule is back in compliance, which resolves it.

use std::fmt;

use metrics::counter;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::summary::MetricsSummary;
use crate::cache::CacheName;

const METRIC_ALERT_FIRED_TOTAL: &str = "clinic_cache_alert_fired_total";
const MIB: u64 = 1024 * 1024;
/// Resolved alerts kept for the paginated listing.
const RESOLVED_RETENTION: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Above,
    Below,
}

impl Direction {
    pub fn breached(self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Above => value > threshold,
            Self::Below => value < threshold,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Above => "above",
            Self::Below => "below",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRule {
    pub id: String,
    /// Dotted path into [`MetricsSummary`], e.g. `overall.hitRate`.
    pub metric: String,
    pub direction: Direction,
    pub threshold: f64,
    pub severity: Severity,
    pub enabled: bool,
    pub description: String,
}

impl AlertRule {
    pub fn new(
        id: impl Into<String>,
        metric: impl Into<String>,
        direction: Direction,
        threshold: f64,
        severity: Severity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            metric: metric.into(),
            direction,
            threshold,
            severity,
            enabled: true,
            description: description.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: Uuid,
    pub rule_id: String,
    pub metric: String,
    pub severity: Severity,
    pub value: f64,
    pub threshold: f64,
    pub message: String,
    #[serde(with = "time::serde::rfc3339")]
    pub raised_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
}

impl Alert {
    pub fn is_active(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// Thresholds for the built-in rule set.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertThresholds {
    /// Percent.
    pub hit_rate_warning: f64,
    /// Percent.
    pub hit_rate_critical: f64,
    pub avg_response_time_ms: f64,
    /// Percent.
    pub error_rate: f64,
    /// Instance whose memory footprint is watched.
    pub memory_cache: CacheName,
    pub memory_bytes: u64,
    pub invalidation_backlog: u64,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            hit_rate_warning: 50.0,
            hit_rate_critical: 30.0,
            avg_response_time_ms: 100.0,
            error_rate: 5.0,
            memory_cache: CacheName::Queries,
            memory_bytes: 80 * MIB,
            invalidation_backlog: 1000,
        }
    }
}

pub fn default_rules(thresholds: &AlertThresholds) -> Vec<AlertRule> {
    vec![
        AlertRule::new(
            "hit_rate_low",
            "overall.hitRate",
            Direction::Below,
            thresholds.hit_rate_warning,
            Severity::Medium,
            "Cache hit rate is low",
        ),
        AlertRule::new(
            "hit_rate_critical",
            "overall.hitRate",
            Direction::Below,
            thresholds.hit_rate_critical,
            Severity::High,
            "Cache hit rate is critically low",
        ),
        AlertRule::new(
            "response_time_high",
            "overall.avgResponseTimeMs",
            Direction::Above,
            thresholds.avg_response_time_ms,
            Severity::Medium,
            "Average cache response time is high",
        ),
        AlertRule::new(
            "error_rate_high",
            "overall.errorRate",
            Direction::Above,
            thresholds.error_rate,
            Severity::High,
            "Cache error rate is high",
        ),
        AlertRule::new(
            "memory_usage_high",
            format!("caches.{}.memoryBytes", thresholds.memory_cache),
            Direction::Above,
            thresholds.memory_bytes as f64,
            Severity::Medium,
            format!("Memory tier of `{}` is near its budget", thresholds.memory_cache),
        ),
        AlertRule::new(
            "invalidation_backlog",
            "invalidation.backlog",
            Direction::Above,
            thresholds.invalidation_backlog as f64,
            Severity::Medium,
            "Invalidation queue is backing up",
        ),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AlertPage {
    pub items: Vec<Alert>,
    pub total: usize,
}

#[derive(Debug, Default)]
pub struct AlertEngine {
    rules: Vec<AlertRule>,
    /// Oldest first.
    alerts: Vec<Alert>,
}

impl AlertEngine {
    pub fn new(rules: Vec<AlertRule>) -> Self {
        Self {
            rules,
            alerts: Vec::new(),
        }
    }

    pub fn rules(&self) -> &[AlertRule] {
        &self.rules
    }

    /// Add a rule, replacing any rule with the same id.
    pub fn add_rule(&mut self, rule: AlertRule) {
        self.rules.retain(|existing| existing.id != rule.id);
        self.rules.push(rule);
    }

    /// Remove every rule on `metric`; their active alerts are resolved.
    pub fn remove_rules(&mut self, metric: &str, now: OffsetDateTime) -> usize {
        let before = self.rules.len();
        let (removed, kept): (Vec<_>, Vec<_>) = self
            .rules
            .drain(..)
            .partition(|rule| rule.metric == metric);
        self.rules = kept;
        for rule in &removed {
            self.resolve(&rule.id, now);
        }
        before - self.rules.len()
    }

    /// Enable or disable every rule on `metric`.
    pub fn set_enabled(&mut self, metric: &str, enabled: bool) -> usize {
        let mut changed = 0;
        for rule in self.rules.iter_mut().filter(|rule| rule.metric == metric) {
            rule.enabled = enabled;
            changed += 1;
        }
        changed
    }

    /// Evaluate every rule; returns the alerts raised by this summary.
    pub fn evaluate(&mut self, summary: &MetricsSummary) -> Vec<Alert> {
        let now = summary.timestamp;
        let mut raised = Vec::new();

        for index in 0..self.rules.len() {
            let rule = &self.rules[index];
            if !rule.enabled {
                let id = rule.id.clone();
                self.resolve(&id, now);
                continue;
            }

            let Some(value) = summary.lookup(&rule.metric) else {
                debug!(rule = %rule.id, metric = %rule.metric, "Alert metric not present in summary");
                continue;
            };

            let breached = rule.direction.breached(value, rule.threshold);
            let active = self.active_index(&rule.id);

            match (breached, active) {
                (true, None) => {
                    let alert = Alert {
                        id: Uuid::new_v4(),
                        rule_id: rule.id.clone(),
                        metric: rule.metric.clone(),
                        severity: rule.severity,
                        value,
                        threshold: rule.threshold,
                        message: format!(
                            "{}: {} is {value:.2}, {} {}",
                            rule.description, rule.metric, rule.direction, rule.threshold
                        ),
                        raised_at: now,
                        resolved_at: None,
                    };
                    counter!(
                        METRIC_ALERT_FIRED_TOTAL,
                        "rule" => rule.id.clone(),
                        "severity" => rule.severity.as_str()
                    )
                    .increment(1);
                    warn!(
                        rule = %rule.id,
                        severity = rule.severity.as_str(),
                        value,
                        threshold = rule.threshold,
                        "Cache alert raised"
                    );
                    raised.push(alert.clone());
                    self.alerts.push(alert);
                }
                (false, Some(_)) => {
                    let id = rule.id.clone();
                    self.resolve(&id, now);
                }
                _ => {}
            }
        }

        self.prune();
        raised
    }

    fn active_index(&self, rule_id: &str) -> Option<usize> {
        self.alerts
            .iter()
            .position(|alert| alert.rule_id == rule_id && alert.is_active())
    }

    fn resolve(&mut self, rule_id: &str, now: OffsetDateTime) {
        if let Some(index) = self.active_index(rule_id) {
            let alert = &mut self.alerts[index];
            alert.resolved_at = Some(now);
            info!(rule = %rule_id, alert_id = %alert.id, "Cache alert resolved");
        }
    }

    fn prune(&mut self) {
        let resolved = self.alerts.iter().filter(|alert| !alert.is_active()).count();
        let mut excess = resolved.saturating_sub(RESOLVED_RETENTION);
        if excess == 0 {
            return;
        }
        self.alerts.retain(|alert| {
            if excess > 0 && !alert.is_active() {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }

    pub fn active(&self) -> Vec<Alert> {
        self.alerts
            .iter()
            .filter(|alert| alert.is_active())
            .cloned()
            .collect()
    }

    pub fn active_count(&self) -> usize {
        self.alerts.iter().filter(|alert| alert.is_active()).count()
    }

    /// Alerts raised at or after `since`, oldest first.
    pub fn raised_since(&self, since: OffsetDateTime) -> Vec<Alert> {
        self.alerts
            .iter()
            .filter(|alert| alert.raised_at >= since)
            .cloned()
            .collect()
    }

    /// All alerts, newest first. `page` starts at 1.
    pub fn page(&self, page: usize, per_page: usize) -> AlertPage {
        let per_page = per_page.max(1);
        let skip = page.saturating_sub(1).saturating_mul(per_page);
        AlertPage {
            items: self
                .alerts
                .iter()
                .rev()
                .skip(skip)
                .take(per_page)
                .cloned()
                .collect(),
            total: self.alerts.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use time::Duration;
    use time::macros::datetime;

    use super::*;
    use crate::cache::CacheMetrics;

    fn summary_with_hit_rate(hit_rate: u64, minute: i64) -> MetricsSummary {
        let metrics = CacheMetrics {
            hits: hit_rate,
            misses: 100 - hit_rate,
            operations: 100,
            ..Default::default()
        };
        MetricsSummary::from_instances(
            datetime!(2024-03-01 10:00 UTC) + Duration::minutes(minute),
            [(CacheName::Patients, metrics)],
            0,
        )
    }

    fn hit_rate_engine() -> AlertEngine {
        AlertEngine::new(vec![AlertRule::new(
            "hit_rate_low",
            "overall.hitRate",
            Direction::Below,
            50.0,
            Severity::Medium,
            "Cache hit rate is low",
        )])
    }

    #[test]
    fn breach_raises_one_alert_until_resolved() {
        let mut engine = hit_rate_engine();

        assert_eq!(engine.evaluate(&summary_with_hit_rate(40, 0)).len(), 1);
        assert!(engine.evaluate(&summary_with_hit_rate(35, 1)).is_empty());
        assert_eq!(engine.active_count(), 1);

        engine.evaluate(&summary_with_hit_rate(60, 2));
        assert_eq!(engine.active_count(), 0);
        let resolved = engine.page(1, 10).items[0].clone();
        assert_eq!(resolved.resolved_at, Some(datetime!(2024-03-01 10:02 UTC)));

        let again = engine.evaluate(&summary_with_hit_rate(30, 3));
        assert_eq!(again.len(), 1);
        assert_ne!(again[0].id, resolved.id);
        assert_eq!(engine.page(1, 10).total, 2);
    }

    #[test]
    fn disabling_a_rule_resolves_its_alert() {
        let mut engine = hit_rate_engine();
        engine.evaluate(&summary_with_hit_rate(10, 0));

        assert_eq!(engine.set_enabled("overall.hitRate", false), 1);
        engine.evaluate(&summary_with_hit_rate(10, 1));
        assert_eq!(engine.active_count(), 0);

        engine.set_enabled("overall.hitRate", true);
        engine.evaluate(&summary_with_hit_rate(10, 2));
        assert_eq!(engine.active_count(), 1);
    }

    #[test]
    fn rules_are_managed_by_metric() {
        let mut engine = AlertEngine::new(default_rules(&AlertThresholds::default()));
        assert_eq!(engine.rules().len(), 6);

        engine.evaluate(&summary_with_hit_rate(10, 0));
        assert_eq!(engine.active_count(), 2);

        let removed = engine.remove_rules("overall.hitRate", datetime!(2024-03-01 11:00 UTC));
        assert_eq!(removed, 2);
        assert_eq!(engine.active_count(), 0);

        engine.add_rule(AlertRule::new(
            "response_time_high",
            "overall.avgResponseTimeMs",
            Direction::Above,
            250.0,
            Severity::High,
            "Average cache response time is high",
        ));
        assert_eq!(engine.rules().len(), 4);
    }

    #[test]
    fn default_rules_cover_memory_and_backlog() {
        let rules = default_rules(&AlertThresholds::default());
        let metrics: Vec<_> = rules.iter().map(|rule| rule.metric.as_str()).collect();
        assert!(metrics.contains(&"caches.queries.memoryBytes"));
        assert!(metrics.contains(&"invalidation.backlog"));

        let memory = rules
            .iter()
            .find(|rule| rule.id == "memory_usage_high")
            .expect("memory rule");
        assert_eq!(memory.threshold, (80 * MIB) as f64);
    }

    #[test]
    fn pages_are_newest_first() {
        let mut engine = hit_rate_engine();
        for minute in 0..3 {
            engine.evaluate(&summary_with_hit_rate(10, minute * 2));
            engine.evaluate(&summary_with_hit_rate(90, minute * 2 + 1));
        }

        let first = engine.page(1, 2);
        assert_eq!(first.total, 3);
        assert_eq!(first.items.len(), 2);
        assert_eq!(first.items[0].raised_at, datetime!(2024-03-01 10:04 UTC));
        assert_eq!(engine.page(2, 2).items.len(), 1);
        assert!(engine.page(3, 2).items.is_empty());
    }
}
