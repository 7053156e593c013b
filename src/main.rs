use std::{process, sync::Arc};

use clinic_cache::{
    cache::{
        CacheConfig, CacheName, CacheRegistry, InvalidationConsumer, InvalidationQueue,
        StoreConfig, StoreStats, spawn_consumer, store,
    },
    config,
    infra::{error::InfraError, telemetry},
    monitor::{CacheMonitor, MetricsSummary},
};
use serde::Serialize;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &InfraError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), InfraError> {
    let (cli_args, settings) = config::load_with_cli().map_err(|err| {
        InfraError::configuration(format!("failed to load configuration: {err}"))
    })?;

    let command = cli_args
        .command
        .unwrap_or(config::Command::Serve(Box::<config::ServeArgs>::default()));

    telemetry::init(&settings.logging)?;

    match command {
        config::Command::Serve(_) => run_serve(settings).await,
        config::Command::Probe(_) => run_probe(settings).await,
    }
}

struct Engine {
    registry: Arc<CacheRegistry>,
    consumer: Arc<InvalidationConsumer>,
    monitor: Arc<CacheMonitor>,
}

async fn build_engine(settings: &config::Settings) -> Engine {
    let remote = store::connect(&StoreConfig::from(&settings.remote_store)).await;
    let cache_config = CacheConfig::from(&settings.cache);

    let registry = Arc::new(CacheRegistry::new(&cache_config, remote));
    let queue = Arc::new(InvalidationQueue::new(cache_config.queue_limit));
    let consumer = Arc::new(InvalidationConsumer::new(
        cache_config,
        registry.clone(),
        queue.clone(),
    ));
    let monitor = Arc::new(CacheMonitor::new(
        registry.clone(),
        queue,
        &settings.monitor,
    ));

    Engine {
        registry,
        consumer,
        monitor,
    }
}

async fn run_serve(settings: config::Settings) -> Result<(), InfraError> {
    let engine = build_engine(&settings).await;

    engine.registry.start_sweepers();
    let consumer_handle = spawn_consumer(engine.consumer.clone());
    let monitor_handle = engine.monitor.clone().spawn();

    info!(
        instances = CacheName::ALL.len(),
        monitor_interval_secs = settings.monitor.interval.as_secs(),
        "Cache engine running"
    );

    let signal = tokio::signal::ctrl_c().await;
    info!("Shutting down cache engine");

    for handle in [consumer_handle, monitor_handle] {
        handle.abort();
        let _ = handle.await;
    }
    engine.consumer.consume_all().await;
    engine.registry.shutdown();

    signal.map_err(InfraError::from)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ProbeReport {
    reachable: bool,
    store: Option<StoreStats>,
    health_score: f64,
    metrics: MetricsSummary,
}

async fn run_probe(settings: config::Settings) -> Result<(), InfraError> {
    let engine = build_engine(&settings).await;
    let cache = engine.registry.get(CacheName::Default);

    let report = ProbeReport {
        reachable: cache.ping().await,
        store: cache.store_stats().await,
        metrics: engine.monitor.poll(),
        health_score: engine.monitor.health_score(),
    };

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
