//! Multi-tier cache engine for the clinic management platform.
//!
//! Named cache instances combine a bounded in-process memory tier with a shared
//! remote key-value store, support tag-based invalidation and stale-while-revalidate
//! reads, and are sampled by a monitor that raises threshold alerts.

pub mod cache;
pub mod config;
pub mod infra;
pub mod monitor;
