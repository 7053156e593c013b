//! Fixed registry of named cache instances.
//!
//! Instances are created once at startup and handed to callers explicitly;
//! nothing in the crate reaches for a global.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::info;

use super::config::CacheConfig;
use super::lock;
use super::manager::CacheManager;
use super::memory::spawn_sweeper;
use super::store::RemoteStore;

const SOURCE: &str = "cache::registry";
const MIB: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheName {
    Patients,
    Appointments,
    Reports,
    Analytics,
    Sessions,
    Queries,
    Default,
}

impl CacheName {
    pub const ALL: [CacheName; 7] = [
        CacheName::Patients,
        CacheName::Appointments,
        CacheName::Reports,
        CacheName::Analytics,
        CacheName::Sessions,
        CacheName::Queries,
        CacheName::Default,
    ];

    /// Key prefix and metric label of the instance.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Patients => "patients",
            Self::Appointments => "appointments",
            Self::Reports => "reports",
            Self::Analytics => "analytics",
            Self::Sessions => "sessions",
            Self::Queries => "queries",
            Self::Default => "default",
        }
    }

    fn index(self) -> usize {
        self as usize
    }

    /// Memory-tier budget in bytes when no override is configured.
    pub fn default_budget(self) -> usize {
        let mib = match self {
            Self::Patients => 50,
            Self::Appointments => 30,
            Self::Reports => 100,
            Self::Analytics => 50,
            Self::Sessions => 20,
            Self::Queries => 100,
            Self::Default => 100,
        };
        mib * MIB
    }
}

impl fmt::Display for CacheName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown cache instance `{0}`")]
pub struct UnknownCacheName(pub String);

impl FromStr for CacheName {
    type Err = UnknownCacheName;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().to_ascii_lowercase();
        CacheName::ALL
            .into_iter()
            .find(|name| name.as_str() == normalized)
            .ok_or_else(|| UnknownCacheName(value.to_string()))
    }
}

/// The seven named instances, sharing one remote store.
pub struct CacheRegistry {
    managers: Vec<Arc<CacheManager>>,
    config: CacheConfig,
    sweepers: Mutex<Vec<JoinHandle<()>>>,
}

impl CacheRegistry {
    pub fn new(config: &CacheConfig, remote: Arc<dyn RemoteStore>) -> Self {
        let managers = CacheName::ALL
            .into_iter()
            .map(|name| {
                Arc::new(CacheManager::new(
                    name.as_str(),
                    config.budget(name),
                    remote.clone(),
                    config.clone(),
                ))
            })
            .collect();

        Self {
            managers,
            config: config.clone(),
            sweepers: Mutex::new(Vec::new()),
        }
    }

    pub fn get(&self, name: CacheName) -> &Arc<CacheManager> {
        &self.managers[name.index()]
    }

    pub fn iter(&self) -> impl Iterator<Item = (CacheName, &Arc<CacheManager>)> {
        CacheName::ALL.into_iter().zip(self.managers.iter())
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Start one expiry sweeper per memory tier. Calling it twice is a no-op.
    pub fn start_sweepers(&self) {
        let mut sweepers = lock::lock(&self.sweepers, SOURCE, "start_sweepers");
        if !sweepers.is_empty() {
            return;
        }
        for (_, manager) in self.iter() {
            sweepers.push(spawn_sweeper(
                manager.memory().clone(),
                self.config.sweep_interval,
            ));
        }
        info!(
            instances = sweepers.len(),
            interval_secs = self.config.sweep_interval.as_secs(),
            "Memory tier sweepers started"
        );
    }

    /// Abort the sweepers.
    pub fn shutdown(&self) {
        let mut sweepers = lock::lock(&self.sweepers, SOURCE, "shutdown");
        for handle in sweepers.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for CacheRegistry {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::options::CacheOptions;
    use crate::cache::store::InMemoryStore;

    #[test]
    fn names_round_trip_through_strings() {
        for name in CacheName::ALL {
            assert_eq!(name.as_str().parse::<CacheName>().expect("known"), name);
        }
        assert_eq!(" Reports ".parse::<CacheName>().expect("known"), CacheName::Reports);
        assert!("billing".parse::<CacheName>().is_err());
    }

    #[test]
    fn default_budgets() {
        assert_eq!(CacheName::Appointments.default_budget(), 30 * MIB);
        assert_eq!(CacheName::Sessions.default_budget(), 20 * MIB);
        assert_eq!(CacheName::Queries.default_budget(), 100 * MIB);
    }

    #[tokio::test]
    async fn instances_are_isolated_by_prefix() {
        let mut config = CacheConfig::default();
        config.budgets.insert(CacheName::Sessions, 4096);
        let registry = CacheRegistry::new(&config, Arc::new(InMemoryStore::new()));

        assert_eq!(registry.get(CacheName::Sessions).memory().max_bytes(), 4096);
        assert_eq!(registry.get(CacheName::Reports).prefix(), "reports");

        registry
            .get(CacheName::Patients)
            .set("42", &"Ana", &CacheOptions::new())
            .await;
        let other: Option<String> = registry
            .get(CacheName::Appointments)
            .get("42", &CacheOptions::new())
            .await;
        assert!(other.is_none());
    }

    #[tokio::test]
    async fn sweepers_start_once_and_stop_on_shutdown() {
        let registry = CacheRegistry::new(&CacheConfig::default(), Arc::new(InMemoryStore::new()));

        registry.start_sweepers();
        registry.start_sweepers();
        assert_eq!(
            lock::lock(&registry.sweepers, SOURCE, "test").len(),
            CacheName::ALL.len()
        );

        registry.shutdown();
        assert!(lock::lock(&registry.sweepers, SOURCE, "test").is_empty());
    }
}
