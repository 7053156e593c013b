use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};

/// Command-line arguments for the clinic-cache binary.
#[derive(Debug, Parser)]
#[command(
    name = "clinic-cache",
    version,
    about = "Multi-tier cache engine for the clinic platform"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "CLINIC_CACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Run the cache engine with its sweepers, invalidation consumer and monitor.
    Serve(Box<ServeArgs>),
    /// Print remote store health and a metrics snapshot as JSON, then exit.
    Probe(ProbeArgs),
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeArgs {
    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ProbeArgs {
    #[command(flatten)]
    pub remote_store: RemoteStoreOverride,
}

#[derive(Debug, Args, Default, Clone)]
pub struct RemoteStoreOverride {
    /// Override the primary remote store URL.
    #[arg(long = "remote-store-url", value_name = "URL")]
    pub remote_store_url: Option<String>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    #[command(flatten)]
    pub remote_store: RemoteStoreOverride,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Fallback remote store endpoint; repeat for several.
    #[arg(long = "remote-store-fallback-url", value_name = "URL")]
    pub remote_store_fallback_urls: Vec<String>,

    /// Override the monitor poll interval.
    #[arg(long = "monitor-interval-seconds", value_name = "SECONDS")]
    pub monitor_interval_seconds: Option<u64>,
}
