//! Cache key definitions.
//!
//! `Namespace` maps logical keys onto the physical keyspace shared by every
//! instance; the free functions build the entity keys data-access code uses.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use time::Date;
use time::macros::format_description;

/// Physical key layout for one cache instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    prefix: String,
}

impl Namespace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// `<prefix>:<key>`
    pub fn key(&self, key: &str) -> String {
        format!("{}:{key}", self.prefix)
    }

    /// `<prefix>:tag:<tag>`
    pub fn tag(&self, tag: &str) -> String {
        format!("{}:tag:{tag}", self.prefix)
    }

    /// Refresh lease marker for `remember_forever`.
    pub fn lease(&self, key: &str) -> String {
        format!("{}:lock:{key}", self.prefix)
    }

    /// Scan pattern covering every key of the instance.
    pub fn pattern(&self) -> String {
        format!("{}:*", self.prefix)
    }
}

/// Compute a hash for any hashable value.
pub fn hash_value<T: Hash + ?Sized>(value: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}

pub fn patient(id: impl std::fmt::Display) -> String {
    format!("patient:{id}")
}

pub fn appointment(id: impl std::fmt::Display) -> String {
    format!("appointment:{id}")
}

/// Day listing, e.g. `appointments:daily:2024-03-01`.
pub fn appointments_daily(date: Date) -> String {
    let format = format_description!("[year]-[month]-[day]");
    let day = date
        .format(format)
        .unwrap_or_else(|_| date.to_julian_day().to_string());
    format!("appointments:daily:{day}")
}

pub fn report(kind: &str, id: impl std::fmt::Display) -> String {
    format!("report:{kind}:{id}")
}

/// Key for a parameterized query result, `query:<name>:<hash>`.
pub fn query<P: Hash + ?Sized>(name: &str, params: &P) -> String {
    format!("query:{name}:{:016x}", hash_value(params))
}
