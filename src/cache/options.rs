//! Per-call cache options.

use std::time::Duration;

use serde::Deserialize;

/// Which tiers an operation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Layer {
    #[default]
    Both,
    Memory,
    Remote,
}

impl Layer {
    pub fn uses_memory(self) -> bool {
        matches!(self, Self::Both | Self::Memory)
    }

    pub fn uses_remote(self) -> bool {
        matches!(self, Self::Both | Self::Remote)
    }
}

/// How long a written entry lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Expiry {
    /// The instance's default TTL (the `medium` tier).
    #[default]
    Default,
    After(Duration),
    Never,
}

/// Named TTL tiers shared by all instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TtlTier {
    Short,
    Medium,
    Long,
    VeryLong,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheOptions {
    pub expiry: Expiry,
    pub tags: Vec<String>,
    pub layer: Layer,
}

impl CacheOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.expiry = Expiry::After(ttl);
        self
    }

    pub fn no_expiry(mut self) -> Self {
        self.expiry = Expiry::Never;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    pub fn layer(mut self, layer: Layer) -> Self {
        self.layer = layer;
        self
    }
}
