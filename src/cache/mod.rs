//! Clinic cache engine.
//!
//! Seven named two-tier caches share one remote store:
//!
//! - **Memory tier**: a byte-bounded in-process map per instance
//! - **Remote tier**: Redis, or an in-process stand-in when none is configured
//!
//! Tag sets in the remote tier drive bulk invalidation, and write paths feed
//! an invalidation queue through [`CacheTrigger`].
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! encoding = "msgpack"
//! compression_threshold_bytes = 1024
//! sweep_interval_secs = 60
//!
//! [cache.ttl]
//! short = 60
//! medium = 300
//!
//! [cache.budgets]
//! sessions = 20
//! ```

mod codec;
mod config;
mod consumer;
mod decorator;
mod events;
pub mod keys;
pub(crate) mod lock;
mod manager;
mod memory;
mod options;
mod planner;
mod registry;
mod stats;
pub mod store;
mod trigger;

pub use codec::{Codec, CodecError, DEFAULT_COMPRESSION_THRESHOLD, Encoding, Payload};
pub use config::CacheConfig;
pub use consumer::{InvalidationConsumer, spawn_consumer};
pub use decorator::{WithCache, with_cache};
pub use events::{Epoch, InvalidationEvent, InvalidationKind, InvalidationQueue};
pub use keys::{Namespace, hash_value};
pub use manager::CacheManager;
pub use memory::{MemoryTier, spawn_sweeper};
pub use options::{CacheOptions, Expiry, Layer, TtlTier};
pub use planner::{InstancePlan, InvalidationPlan};
pub use registry::{CacheName, CacheRegistry, UnknownCacheName};
pub use stats::{CacheMetrics, CacheStats, HitTier, RESPONSE_WINDOW};
pub use store::{InMemoryStore, RedisStore, RemoteStore, StoreConfig, StoreError, StoreStats};
pub use trigger::{APPOINTMENT_STATS_TAG, CacheTrigger, PATIENT_LISTS_TAG};
