//! Explicit read-through wrapper for data-access functions.
//!
//! ```ignore
//! let find_patient = with_cache(
//!     registry.get(CacheName::Patients).clone(),
//!     |id: &Uuid| keys::patient(id),
//!     |_| Duration::from_secs(300),
//!     move |id| repo.find_patient(id),
//! );
//! let patient = find_patient.call(id).await?;
//! ```

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;

use super::manager::CacheManager;
use super::options::CacheOptions;

/// A data-access function whose results are cached under `key_fn(args)`.
pub struct WithCache<A, K, L, F> {
    cache: Arc<CacheManager>,
    key_fn: K,
    ttl_fn: L,
    fetch: F,
    tags: Vec<String>,
    _args: PhantomData<fn(A)>,
}

pub fn with_cache<A, K, L, F, Fut, T, E>(
    cache: Arc<CacheManager>,
    key_fn: K,
    ttl_fn: L,
    fetch: F,
) -> WithCache<A, K, L, F>
where
    K: Fn(&A) -> String,
    L: Fn(&A) -> Duration,
    F: Fn(A) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    WithCache {
        cache,
        key_fn,
        ttl_fn,
        fetch,
        tags: Vec::new(),
        _args: PhantomData,
    }
}

impl<A, K, L, F, Fut, T, E> WithCache<A, K, L, F>
where
    K: Fn(&A) -> String,
    L: Fn(&A) -> Duration,
    F: Fn(A) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    T: Serialize + DeserializeOwned,
{
    /// Tag every cached result, for bulk invalidation.
    pub fn tagged<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn key(&self, args: &A) -> String {
        (self.key_fn)(args)
    }

    pub async fn call(&self, args: A) -> Result<T, E> {
        let key = (self.key_fn)(&args);
        let options = CacheOptions::new()
            .ttl((self.ttl_fn)(&args))
            .tags(self.tags.iter().cloned());

        self.cache
            .remember(&key, &options, || (self.fetch)(args))
            .await
    }

    /// Drop the cached result for `args`.
    pub async fn invalidate(&self, args: &A) {
        self.cache.del(&(self.key_fn)(args)).await;
    }
}
