//! Configuration layer: typed settings with layered precedence (file → env → CLI).

mod cli;

use std::{
    collections::BTreeMap,
    num::{NonZeroU32, NonZeroUsize},
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::{CacheName, Encoding, TtlTier};
use crate::monitor::AlertThresholds;

pub use cli::{CliArgs, Command, ProbeArgs, RemoteStoreOverride, ServeArgs, ServeOverrides};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "clinic-cache";
const ENV_PREFIX: &str = "CLINIC_CACHE";
const MIB: u64 = 1024 * 1024;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;
const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 2000;
const DEFAULT_CONNECT_ATTEMPTS: u64 = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 200;
const DEFAULT_COMPRESSION_THRESHOLD_BYTES: usize = 1024;
const DEFAULT_TTL_SHORT_SECS: u64 = 60;
const DEFAULT_TTL_MEDIUM_SECS: u64 = 300;
const DEFAULT_TTL_LONG_SECS: u64 = 1800;
const DEFAULT_TTL_VERY_LONG_SECS: u64 = 3600;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;
const DEFAULT_LEASE_TTL_SECS: u64 = 30;
const DEFAULT_LEASE_POLL_MS: u64 = 100;
const DEFAULT_CLEAR_BATCH_SIZE: usize = 100;
const DEFAULT_QUEUE_LIMIT: usize = 10_000;
const DEFAULT_BATCH_LIMIT: usize = 500;
const DEFAULT_CONSUME_INTERVAL_MS: u64 = 1000;
const DEFAULT_MONITOR_INTERVAL_SECS: u64 = 60;
const DEFAULT_HISTORY_LIMIT: usize = 1440;

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub remote_store: RemoteStoreSettings,
    pub cache: CacheSettings,
    pub monitor: MonitorSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct RemoteStoreSettings {
    pub url: Option<String>,
    pub fallback_urls: Vec<String>,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    pub connect_attempts: NonZeroU32,
    pub retry_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub encoding: Encoding,
    pub compression_threshold_bytes: usize,
    pub ttl: TtlSettings,
    pub sweep_interval: Duration,
    /// Memory budget overrides in bytes; names not listed keep their defaults.
    pub budgets: BTreeMap<CacheName, usize>,
    pub lease_ttl: Duration,
    pub lease_poll: Duration,
    pub clear_batch_size: NonZeroUsize,
    pub invalidation: InvalidationSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlSettings {
    pub short: Duration,
    pub medium: Duration,
    pub long: Duration,
    pub very_long: Duration,
}

impl TtlSettings {
    pub fn get(&self, tier: TtlTier) -> Duration {
        match tier {
            TtlTier::Short => self.short,
            TtlTier::Medium => self.medium,
            TtlTier::Long => self.long,
            TtlTier::VeryLong => self.very_long,
        }
    }
}

impl Default for TtlSettings {
    fn default() -> Self {
        Self {
            short: Duration::from_secs(DEFAULT_TTL_SHORT_SECS),
            medium: Duration::from_secs(DEFAULT_TTL_MEDIUM_SECS),
            long: Duration::from_secs(DEFAULT_TTL_LONG_SECS),
            very_long: Duration::from_secs(DEFAULT_TTL_VERY_LONG_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InvalidationSettings {
    pub queue_limit: NonZeroUsize,
    pub batch_limit: NonZeroUsize,
    pub consume_interval: Duration,
}

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub history_limit: NonZeroUsize,
    pub thresholds: AlertThresholds,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(
        Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .list_separator(",")
            .with_list_parse_key("remote_store.fallback_urls")
            .try_parsing(true),
    );

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Serve(args)) => raw.apply_serve_overrides(&args.overrides),
        Some(Command::Probe(args)) => raw.apply_remote_store_override(&args.remote_store),
        None => raw.apply_serve_overrides(&ServeOverrides::default()),
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    remote_store: RawRemoteStoreSettings,
    cache: RawCacheSettings,
    monitor: RawMonitorSettings,
}

impl RawSettings {
    fn apply_serve_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if !overrides.remote_store_fallback_urls.is_empty() {
            self.remote_store.fallback_urls = Some(overrides.remote_store_fallback_urls.clone());
        }
        if let Some(seconds) = overrides.monitor_interval_seconds {
            self.monitor.interval_secs = Some(seconds);
        }

        self.apply_remote_store_override(&overrides.remote_store);
    }

    fn apply_remote_store_override(&mut self, overrides: &RemoteStoreOverride) {
        if let Some(url) = overrides.remote_store_url.as_ref() {
            self.remote_store.url = Some(url.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            remote_store,
            cache,
            monitor,
        } = raw;

        let logging = build_logging_settings(logging)?;
        let remote_store = build_remote_store_settings(remote_store)?;
        let cache = build_cache_settings(cache)?;
        let monitor = build_monitor_settings(monitor)?;

        Ok(Self {
            logging,
            remote_store,
            cache,
            monitor,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_remote_store_settings(
    store: RawRemoteStoreSettings,
) -> Result<RemoteStoreSettings, LoadError> {
    let url = non_blank(store.url);
    if let Some(url) = url.as_deref() {
        validate_store_url(url, "remote_store.url")?;
    }

    let mut fallback_urls = Vec::new();
    for candidate in store.fallback_urls.unwrap_or_default() {
        if let Some(candidate) = non_blank(Some(candidate)) {
            validate_store_url(&candidate, "remote_store.fallback_urls")?;
            fallback_urls.push(candidate);
        }
    }

    let connect_timeout = positive_millis(
        store
            .connect_timeout_ms
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_MS),
        "remote_store.connect_timeout_ms",
    )?;
    let operation_timeout = positive_millis(
        store
            .operation_timeout_ms
            .unwrap_or(DEFAULT_OPERATION_TIMEOUT_MS),
        "remote_store.operation_timeout_ms",
    )?;
    let connect_attempts = non_zero_u32(
        store.connect_attempts.unwrap_or(DEFAULT_CONNECT_ATTEMPTS),
        "remote_store.connect_attempts",
    )?;
    let retry_backoff =
        Duration::from_millis(store.retry_backoff_ms.unwrap_or(DEFAULT_RETRY_BACKOFF_MS));

    Ok(RemoteStoreSettings {
        url,
        fallback_urls,
        connect_timeout,
        operation_timeout,
        connect_attempts,
        retry_backoff,
    })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let ttl = TtlSettings {
        short: positive_secs(
            cache.ttl.short.unwrap_or(DEFAULT_TTL_SHORT_SECS),
            "cache.ttl.short",
        )?,
        medium: positive_secs(
            cache.ttl.medium.unwrap_or(DEFAULT_TTL_MEDIUM_SECS),
            "cache.ttl.medium",
        )?,
        long: positive_secs(
            cache.ttl.long.unwrap_or(DEFAULT_TTL_LONG_SECS),
            "cache.ttl.long",
        )?,
        very_long: positive_secs(
            cache.ttl.very_long.unwrap_or(DEFAULT_TTL_VERY_LONG_SECS),
            "cache.ttl.very_long",
        )?,
    };
    if !(ttl.short <= ttl.medium && ttl.medium <= ttl.long && ttl.long <= ttl.very_long) {
        return Err(LoadError::invalid(
            "cache.ttl",
            "tiers must be ordered short <= medium <= long <= very_long",
        ));
    }

    let mut budgets = BTreeMap::new();
    for (name, mebibytes) in cache.budgets {
        let parsed = CacheName::from_str(&name).map_err(|_| {
            LoadError::invalid("cache.budgets", format!("unknown cache instance `{name}`"))
        })?;
        if mebibytes == 0 {
            return Err(LoadError::invalid(
                "cache.budgets",
                format!("budget for `{name}` must be greater than zero"),
            ));
        }
        let bytes = usize::try_from(mebibytes.saturating_mul(MIB)).map_err(|_| {
            LoadError::invalid(
                "cache.budgets",
                format!("budget for `{name}` exceeds supported range"),
            )
        })?;
        budgets.insert(parsed, bytes);
    }

    let invalidation = InvalidationSettings {
        queue_limit: non_zero_usize(
            cache
                .invalidation
                .queue_limit
                .unwrap_or(DEFAULT_QUEUE_LIMIT),
            "cache.invalidation.queue_limit",
        )?,
        batch_limit: non_zero_usize(
            cache
                .invalidation
                .batch_limit
                .unwrap_or(DEFAULT_BATCH_LIMIT),
            "cache.invalidation.batch_limit",
        )?,
        consume_interval: positive_millis(
            cache
                .invalidation
                .consume_interval_ms
                .unwrap_or(DEFAULT_CONSUME_INTERVAL_MS),
            "cache.invalidation.consume_interval_ms",
        )?,
    };

    Ok(CacheSettings {
        encoding: cache.encoding.unwrap_or_default(),
        compression_threshold_bytes: cache
            .compression_threshold_bytes
            .unwrap_or(DEFAULT_COMPRESSION_THRESHOLD_BYTES),
        ttl,
        sweep_interval: positive_secs(
            cache
                .sweep_interval_secs
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
            "cache.sweep_interval_secs",
        )?,
        budgets,
        lease_ttl: positive_secs(
            cache.lease_ttl_secs.unwrap_or(DEFAULT_LEASE_TTL_SECS),
            "cache.lease_ttl_secs",
        )?,
        lease_poll: positive_millis(
            cache.lease_poll_ms.unwrap_or(DEFAULT_LEASE_POLL_MS),
            "cache.lease_poll_ms",
        )?,
        clear_batch_size: non_zero_usize(
            cache.clear_batch_size.unwrap_or(DEFAULT_CLEAR_BATCH_SIZE),
            "cache.clear_batch_size",
        )?,
        invalidation,
    })
}

fn build_monitor_settings(monitor: RawMonitorSettings) -> Result<MonitorSettings, LoadError> {
    let interval = positive_secs(
        monitor
            .interval_secs
            .unwrap_or(DEFAULT_MONITOR_INTERVAL_SECS),
        "monitor.interval_secs",
    )?;
    let history_limit = non_zero_usize(
        monitor.history_limit.unwrap_or(DEFAULT_HISTORY_LIMIT),
        "monitor.history_limit",
    )?;

    let defaults = AlertThresholds::default();
    let raw = monitor.thresholds;
    let thresholds = AlertThresholds {
        hit_rate_warning: percent(
            raw.hit_rate_warning.unwrap_or(defaults.hit_rate_warning),
            "monitor.thresholds.hit_rate_warning",
        )?,
        hit_rate_critical: percent(
            raw.hit_rate_critical.unwrap_or(defaults.hit_rate_critical),
            "monitor.thresholds.hit_rate_critical",
        )?,
        avg_response_time_ms: non_negative(
            raw.avg_response_time_ms
                .unwrap_or(defaults.avg_response_time_ms),
            "monitor.thresholds.avg_response_time_ms",
        )?,
        error_rate: percent(
            raw.error_rate.unwrap_or(defaults.error_rate),
            "monitor.thresholds.error_rate",
        )?,
        memory_cache: match raw.memory_cache {
            Some(name) => CacheName::from_str(&name).map_err(|_| {
                LoadError::invalid(
                    "monitor.thresholds.memory_cache",
                    format!("unknown cache instance `{name}`"),
                )
            })?,
            None => defaults.memory_cache,
        },
        memory_bytes: raw
            .memory_mb
            .map(|mebibytes| mebibytes.saturating_mul(MIB))
            .unwrap_or(defaults.memory_bytes),
        invalidation_backlog: raw
            .invalidation_backlog
            .unwrap_or(defaults.invalidation_backlog),
    };

    Ok(MonitorSettings {
        interval,
        history_limit,
        thresholds,
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRemoteStoreSettings {
    url: Option<String>,
    fallback_urls: Option<Vec<String>>,
    connect_timeout_ms: Option<u64>,
    operation_timeout_ms: Option<u64>,
    connect_attempts: Option<u64>,
    retry_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    encoding: Option<Encoding>,
    compression_threshold_bytes: Option<usize>,
    ttl: RawTtlSettings,
    sweep_interval_secs: Option<u64>,
    /// Per-instance budgets in MiB.
    budgets: BTreeMap<String, u64>,
    lease_ttl_secs: Option<u64>,
    lease_poll_ms: Option<u64>,
    clear_batch_size: Option<usize>,
    invalidation: RawInvalidationSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawTtlSettings {
    short: Option<u64>,
    medium: Option<u64>,
    long: Option<u64>,
    very_long: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawInvalidationSettings {
    queue_limit: Option<usize>,
    batch_limit: Option<usize>,
    consume_interval_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMonitorSettings {
    interval_secs: Option<u64>,
    history_limit: Option<usize>,
    thresholds: RawThresholdSettings,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawThresholdSettings {
    hit_rate_warning: Option<f64>,
    hit_rate_critical: Option<f64>,
    avg_response_time_ms: Option<f64>,
    error_rate: Option<f64>,
    memory_cache: Option<String>,
    memory_mb: Option<u64>,
    invalidation_backlog: Option<u64>,
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.and_then(|value| {
        let trimmed = value.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    })
}

fn validate_store_url(value: &str, key: &'static str) -> Result<(), LoadError> {
    let parsed = url::Url::parse(value)
        .map_err(|err| LoadError::invalid(key, format!("invalid URL: {err}")))?;
    match parsed.scheme() {
        "redis" | "rediss" | "redis+unix" | "unix" => Ok(()),
        other => Err(LoadError::invalid(
            key,
            format!("unsupported scheme `{other}`"),
        )),
    }
}

fn positive_secs(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_secs(value))
}

fn positive_millis(value: u64, key: &'static str) -> Result<Duration, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(value))
}

fn percent(value: f64, key: &'static str) -> Result<f64, LoadError> {
    if !(0.0..=100.0).contains(&value) {
        return Err(LoadError::invalid(key, "must be between 0 and 100"));
    }
    Ok(value)
}

fn non_negative(value: f64, key: &'static str) -> Result<f64, LoadError> {
    if !value.is_finite() || value < 0.0 {
        return Err(LoadError::invalid(key, "must be a non-negative number"));
    }
    Ok(value)
}

fn non_zero_u32(value: u64, key: &'static str) -> Result<NonZeroU32, LoadError> {
    if value == 0 {
        return Err(LoadError::invalid(key, "must be greater than zero"));
    }
    let value_u32: u32 = value
        .try_into()
        .map_err(|_| LoadError::invalid(key, "value exceeds supported range for u32"))?;
    NonZeroU32::new(value_u32).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
