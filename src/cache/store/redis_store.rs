use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use redis::{RedisError, RedisResult, aio::ConnectionManager};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};
use url::Url;

use super::{KeyStream, RemoteStore, StoreConfig, StoreError, StoreStats};

const SCAN_PAGE_SIZE: usize = 200;

struct Endpoint {
    /// Credential-free form of the URL, safe to log.
    label: String,
    conn: ConnectionManager,
}

/// Remote store backed by a Redis-compatible server.
///
/// Operations run against the primary endpoint first; a transient failure
/// (connection error or timeout) is retried once against each fallback
/// endpoint, in configuration order, before it is surfaced.
pub struct RedisStore {
    endpoints: Vec<Endpoint>,
    operation_timeout: Duration,
}

impl RedisStore {
    /// Connect to the primary endpoint, with bounded retries, and to any
    /// reachable fallback endpoints.
    pub async fn connect(url: &str, config: &StoreConfig) -> Result<Self, StoreError> {
        let primary = connect_endpoint(url, config).await?;
        info!(endpoint = %primary.label, "Connected to remote store");

        let mut endpoints = vec![primary];
        for fallback in &config.fallback_urls {
            match connect_endpoint(fallback, config).await {
                Ok(endpoint) => {
                    info!(endpoint = %endpoint.label, "Connected to fallback remote store");
                    endpoints.push(endpoint);
                }
                Err(err) => warn!(
                    endpoint = %redact(fallback),
                    error = %err,
                    "Skipping unreachable fallback endpoint"
                ),
            }
        }

        Ok(Self {
            endpoints,
            operation_timeout: config.operation_timeout,
        })
    }

    async fn attempt<T, F, Fut>(
        &self,
        endpoint: &Endpoint,
        op: &'static str,
        command: &F,
    ) -> Result<T, StoreError>
    where
        F: Fn(ConnectionManager) -> Fut + Send + Sync,
        Fut: Future<Output = RedisResult<T>> + Send,
        T: Send,
    {
        match timeout(self.operation_timeout, command(endpoint.conn.clone())).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(classify(op, err)),
            Err(_) => Err(StoreError::Timeout {
                op,
                timeout: self.operation_timeout,
            }),
        }
    }

    /// Run a command, fanning out to fallback endpoints on transient failure.
    async fn run<T, F, Fut>(&self, op: &'static str, command: F) -> Result<T, StoreError>
    where
        F: Fn(ConnectionManager) -> Fut + Send + Sync,
        Fut: Future<Output = RedisResult<T>> + Send,
        T: Send,
    {
        fan_out(op, &self.endpoints, |endpoint| {
            self.attempt(endpoint, op, &command)
        })
        .await
    }

    /// Run a command against the primary endpoint only.
    async fn run_on_primary<T, F, Fut>(&self, op: &'static str, command: F) -> Result<T, StoreError>
    where
        F: Fn(ConnectionManager) -> Fut + Send + Sync,
        Fut: Future<Output = RedisResult<T>> + Send,
        T: Send,
    {
        fan_out(op, primary_only(&self.endpoints), |endpoint| {
            self.attempt(endpoint, op, &command)
        })
        .await
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// Try each endpoint in order until one succeeds.
///
/// Transient failures move on to the next endpoint; a command rejection
/// stops immediately. When every endpoint fails transiently the last error
/// is returned.
async fn fan_out<'a, E, T, F, Fut>(
    op: &'static str,
    endpoints: &'a [E],
    mut attempt: F,
) -> Result<T, StoreError>
where
    E: fmt::Display,
    F: FnMut(&'a E) -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut last_error = StoreError::unavailable("no endpoints configured");

    for endpoint in endpoints {
        match attempt(endpoint).await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() => {
                debug!(op, endpoint = %endpoint, error = %err, "Remote store attempt failed");
                last_error = err;
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_error)
}

/// Cursor-based and server-local commands only make sense on the primary.
fn primary_only<E>(endpoints: &[E]) -> &[E] {
    &endpoints[..endpoints.len().min(1)]
}

async fn connect_endpoint(url: &str, config: &StoreConfig) -> Result<Endpoint, StoreError> {
    let label = redact(url);
    let client = redis::Client::open(url)
        .map_err(|err| StoreError::unavailable(format!("invalid endpoint `{label}`: {err}")))?;

    let attempts = config.connect_attempts.max(1);
    let mut attempt = 1;
    loop {
        let reason = match timeout(config.connect_timeout, ConnectionManager::new(client.clone()))
            .await
        {
            Ok(Ok(conn)) => return Ok(Endpoint { label, conn }),
            Ok(Err(err)) => err.to_string(),
            Err(_) => format!("connect timed out after {:?}", config.connect_timeout),
        };

        if attempt >= attempts {
            return Err(StoreError::unavailable(format!(
                "`{label}` unreachable after {attempts} attempts: {reason}"
            )));
        }

        let backoff = config.retry_backoff * attempt;
        warn!(
            endpoint = %label,
            attempt,
            attempts,
            backoff_ms = backoff.as_millis() as u64,
            reason = %reason,
            "Remote store connection failed, retrying"
        );
        sleep(backoff).await;
        attempt += 1;
    }
}

fn classify(op: &'static str, err: RedisError) -> StoreError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
    {
        StoreError::unavailable(format!("{op}: {err}"))
    } else {
        StoreError::command(op, err.to_string())
    }
}

/// Strip credentials from an endpoint URL.
fn redact(raw: &str) -> String {
    match Url::parse(raw) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("***"));
            }
            url.to_string()
        }
        Err(_) => "<invalid url>".to_string(),
    }
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Interpret a `PTTL` reply: negative values mean no expiry or no key.
fn remaining_ttl(pttl_ms: i64) -> Option<Duration> {
    u64::try_from(pttl_ms).ok().map(Duration::from_millis)
}

fn parse_used_memory(info: &str) -> Option<u64> {
    info.lines()
        .find_map(|line| line.strip_prefix("used_memory:"))
        .and_then(|value| value.trim().parse().ok())
}

#[async_trait]
impl RemoteStore for RedisStore {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.run("GET", move |mut conn| async move {
            redis::cmd("GET").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn get_with_ttl(
        &self,
        key: &str,
    ) -> Result<Option<(Vec<u8>, Option<Duration>)>, StoreError> {
        let (value, pttl): (Option<Vec<u8>>, i64) = self
            .run("GET PTTL", move |mut conn| async move {
                let mut pipe = redis::pipe();
                pipe.atomic().cmd("GET").arg(key).cmd("PTTL").arg(key);
                pipe.query_async(&mut conn).await
            })
            .await?;
        Ok(value.map(|value| (value, remaining_ttl(pttl))))
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), StoreError> {
        self.run("SET", move |mut conn| async move {
            let mut cmd = redis::cmd("SET");
            cmd.arg(key).arg(value);
            if let Some(ttl) = ttl {
                cmd.arg("PX").arg(ttl_millis(ttl));
            }
            cmd.query_async(&mut conn).await
        })
        .await
    }

    async fn set_nx(&self, key: &str, value: &[u8], ttl: Duration) -> Result<bool, StoreError> {
        let reply: Option<String> = self
            .run("SET NX", move |mut conn| async move {
                redis::cmd("SET")
                    .arg(key)
                    .arg(value)
                    .arg("NX")
                    .arg("PX")
                    .arg(ttl_millis(ttl))
                    .query_async(&mut conn)
                    .await
            })
            .await?;
        Ok(reply.is_some())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, StoreError> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.run("DEL", move |mut conn| async move {
            redis::cmd("DEL").arg(keys).query_async(&mut conn).await
        })
        .await
    }

    async fn exists(&self, key: &str) -> Result<bool, StoreError> {
        self.run("EXISTS", move |mut conn| async move {
            redis::cmd("EXISTS").arg(key).query_async(&mut conn).await
        })
        .await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, StoreError> {
        self.run("PEXPIRE", move |mut conn| async move {
            redis::cmd("PEXPIRE")
                .arg(key)
                .arg(ttl_millis(ttl))
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn sadd(&self, key: &str, members: &[String]) -> Result<u64, StoreError> {
        if members.is_empty() {
            return Ok(0);
        }
        self.run("SADD", move |mut conn| async move {
            redis::cmd("SADD")
                .arg(key)
                .arg(members)
                .query_async(&mut conn)
                .await
        })
        .await
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, StoreError> {
        self.run("SMEMBERS", move |mut conn| async move {
            redis::cmd("SMEMBERS").arg(key).query_async(&mut conn).await
        })
        .await
    }

    fn scan<'a>(&'a self, pattern: &'a str) -> KeyStream<'a> {
        // Cursors are only meaningful on the server that issued them.
        Box::pin(stream! {
            let mut cursor: u64 = 0;
            loop {
                let page: Result<(u64, Vec<String>), StoreError> = self
                    .run_on_primary("SCAN", move |mut conn| async move {
                        redis::cmd("SCAN")
                            .arg(cursor)
                            .arg("MATCH")
                            .arg(pattern)
                            .arg("COUNT")
                            .arg(SCAN_PAGE_SIZE)
                            .query_async(&mut conn)
                            .await
                    })
                    .await;
                let (next, keys) = match page {
                    Ok(page) => page,
                    Err(err) => {
                        yield Err(err);
                        break;
                    }
                };

                for key in keys {
                    yield Ok(key);
                }

                if next == 0 {
                    break;
                }
                cursor = next;
            }
        })
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let _pong: String = self
            .run("PING", |mut conn| async move {
                redis::cmd("PING").query_async(&mut conn).await
            })
            .await?;
        Ok(())
    }

    async fn stats(&self) -> Result<StoreStats, StoreError> {
        let key_count: u64 = self
            .run_on_primary("DBSIZE", |mut conn| async move {
                redis::cmd("DBSIZE").query_async(&mut conn).await
            })
            .await?;
        let info: String = self
            .run_on_primary("INFO", |mut conn| async move {
                redis::cmd("INFO").arg("memory").query_async(&mut conn).await
            })
            .await?;

        Ok(StoreStats {
            backend: self.backend(),
            endpoint: self.endpoints.first().map(|endpoint| endpoint.label.clone()),
            key_count,
            used_memory_bytes: parse_used_memory(&info),
        })
    }
}
