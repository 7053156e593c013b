//! Remote key-value store adapters.
//!
//! [`RemoteStore`] is the narrow surface the cache manager needs from the shared
//! store. [`RedisStore`] talks to a real server; [`InMemoryStore`] stands in when
//! none is configured or reachable.

mod memory;
mod redis_store;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

pub use memory::InMemoryStore;
pub use redis_store::RedisStore;

const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 2000;
const DEFAULT_OPERATION_TIMEOUT_MS: u64 = 2000;
const DEFAULT_CONNECT_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BACKOFF_MS: u64 = 200;

/// Lazily produced keys matching a scan pattern.
pub type KeyStream<'a> = BoxStream<'a, Result<String, StoreError>>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("remote store unavailable: {0}")]
    Unavailable(String),
    #[error("remote store `{op}` timed out after {timeout:?}")]
    Timeout { op: &'static str, timeout: Duration },
    #[error("remote store rejected `{op}`: {reason}")]
    Command { op: &'static str, reason: String },
}

impl StoreError {
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable(message.into())
    }

    pub fn command(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Command {
            op,
            reason: reason.into(),
        }
    }

    /// Connectivity failures, as opposed to the store rejecting a command.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_) | Self::Timeout { .. })
    }
}

/// Health snapshot of the remote store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoreStats {
    pub backend: &'static str,
    pub endpoint: Option<String>,
    pub key_count: u64,
    pub used_memory_bytes: Option<u64>,
}

/// Operations the cache manager issues against the shared store.
///
/// Every call may fail with a [`StoreError`]; the manager converts failures
/// into misses or no-ops.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Short backend name used in logs and stats.
    fn backend(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Read a value together with its remaining time to live.
    ///
    /// The TTL is `None` when the key never expires.
    async fn get_with_ttl(
        &self,
        key: &str,
    ) -> Result<Option<(Vec<u8>, Option<Duration>)>, StoreError>;

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError>;

    /// Set only if the key is absent. Returns whether the value was written.
    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StoreError>;

    /// Delete keys, returning how many existed.
    async fn del(&self, keys: &[String]) -> Result<u64, StoreError>;

    async fn exists(&self, key: &str) -> Result<bool, StoreError>;

    /// Set a TTL on an existing key. Returns false when the key is missing.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError>;

    /// Add members to a set record, returning how many were new.
    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, StoreError>;

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError>;

    /// Stream keys matching a glob pattern (`*`, `?`).
    fn scan<'a>(&'a self, pattern: &'a str) -> KeyStream<'a>;

    async fn ping(&self) -> Result<(), StoreError>;

    async fn stats(&self) -> Result<StoreStats, StoreError>;
}

/// Connection settings for the remote store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Primary endpoint. `None` selects the in-process store.
    pub url: Option<String>,
    /// Endpoints tried once each when the primary fails transiently.
    pub fallback_urls: Vec<String>,
    pub connect_timeout: Duration,
    pub operation_timeout: Duration,
    pub connect_attempts: u32,
    pub retry_backoff: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            fallback_urls: Vec::new(),
            connect_timeout: Duration::from_millis(DEFAULT_CONNECT_TIMEOUT_MS),
            operation_timeout: Duration::from_millis(DEFAULT_OPERATION_TIMEOUT_MS),
            connect_attempts: DEFAULT_CONNECT_ATTEMPTS,
            retry_backoff: Duration::from_millis(DEFAULT_RETRY_BACKOFF_MS),
        }
    }
}

impl From<&crate::config::RemoteStoreSettings> for StoreConfig {
    fn from(settings: &crate::config::RemoteStoreSettings) -> Self {
        Self {
            url: settings.url.clone(),
            fallback_urls: settings.fallback_urls.clone(),
            connect_timeout: settings.connect_timeout,
            operation_timeout: settings.operation_timeout,
            connect_attempts: settings.connect_attempts.get(),
            retry_backoff: settings.retry_backoff,
        }
    }
}

/// Build the remote store selected by configuration.
///
/// Falls back to the in-process store when no URL is configured or the
/// primary endpoint cannot be reached within the bounded connect attempts.
pub async fn connect(config: &StoreConfig) -> Arc<dyn RemoteStore> {
    let Some(url) = config.url.as_deref() else {
        info!(backend = "memory", "No remote store configured, using in-process store");
        return Arc::new(InMemoryStore::new());
    };

    match RedisStore::connect(url, config).await {
        Ok(store) => Arc::new(store),
        Err(err) => {
            warn!(
                error = %err,
                backend = "memory",
                "Remote store unreachable, degrading to in-process store"
            );
            Arc::new(InMemoryStore::new())
        }
    }
}

/// Glob match supporting `*` (any run) and `?` (any single character).
pub(crate) fn glob_matches(pattern: &str, candidate: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let candidate: Vec<char> = candidate.chars().collect();

    let (mut p, mut c) = (0, 0);
    let mut backtrack: Option<(usize, usize)> = None;

    while c < candidate.len() {
        match pattern.get(p) {
            Some('*') => {
                backtrack = Some((p, c));
                p += 1;
            }
            Some(&ch) if ch == '?' || ch == candidate[c] => {
                p += 1;
                c += 1;
            }
            _ => match backtrack {
                Some((star, matched)) => {
                    p = star + 1;
                    c = matched + 1;
                    backtrack = Some((star, matched + 1));
                }
                None => return false,
            },
        }
    }

    pattern[p..].iter().all(|&ch| ch == '*')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_handles_prefix_patterns() {
        assert!(glob_matches("patients:*", "patients:patient:42"));
        assert!(glob_matches("patients:*", "patients:"));
        assert!(!glob_matches("patients:*", "reports:patient:42"));
    }

    #[test]
    fn glob_handles_wildcards_in_the_middle() {
        assert!(glob_matches("*:tag:*", "patients:tag:vip"));
        assert!(glob_matches("p?tients:*", "patients:1"));
        assert!(!glob_matches("p?tients:*", "ptients:1"));
        assert!(glob_matches("a*b*c", "axxbyyc"));
        assert!(!glob_matches("a*b*c", "axxbyy"));
    }

    #[test]
    fn exact_patterns_require_full_match() {
        assert!(glob_matches("sessions:abc", "sessions:abc"));
        assert!(!glob_matches("sessions:abc", "sessions:abcd"));
    }

    #[test]
    fn transient_errors_are_classified() {
        assert!(StoreError::unavailable("down").is_transient());
        assert!(
            StoreError::Timeout {
                op: "GET",
                timeout: Duration::from_secs(1)
            }
            .is_transient()
        );
        assert!(!StoreError::command("SADD", "WRONGTYPE").is_transient());
    }

    #[tokio::test]
    async fn connect_without_url_uses_in_process_store() {
        let store = connect(&StoreConfig::default()).await;
        assert_eq!(store.backend(), "memory");
        assert!(store.ping().await.is_ok());
    }
}
