//! Shaper Agent - Main Entry Point
//!
//! Keeps the client registry in step with the clients file, drains the
//! shaper's counters on a fixed interval and reports what accumulated.
//! With `metrics_addr` set, the published counters are served for
//! Prometheus to scrape.

use anyhow::Context;
use metrics_exporter_prometheus::PrometheusBuilder;
use shaper_common::MonotonicClock;
use shaper_dataplane::{load_clients, Collector, Registry, ShaperConfig, ShaperEngine, SyncReport};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("EDT shaper agent v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::var("SHAPER_CONFIG").unwrap_or_else(|_| "/etc/shaper/shaper.json".into());
    let config = match ShaperConfig::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(path = %config_path, error = %e, "config not loaded, using defaults");
            ShaperConfig::default()
        }
    };

    if let Some(addr) = config.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .with_context(|| format!("installing metrics exporter on {addr}"))?;
        tracing::info!(%addr, "serving metrics");
    }

    let registry = Arc::new(Registry::new());
    if let Some(path) = &config.clients_path {
        sync_clients(&registry, path)
            .with_context(|| format!("initial client sync from {}", path.display()))?;
    }

    let engine = Arc::new(
        ShaperEngine::new(config.clone(), registry.clone(), Arc::new(MonotonicClock::new()))
            .context("building shaper engine")?,
    );
    let collector = Arc::new(Collector::new(engine.clone()));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let collector_task = tokio::spawn(collector.clone().run(shutdown_rx));

    let mut sync_interval = tokio::time::interval(config.collect_interval());
    let mut report_interval = tokio::time::interval(config.report_interval());
    // The first tick fires immediately; nothing to report yet
    report_interval.tick().await;

    loop {
        tokio::select! {
            _ = sync_interval.tick() => {
                if let Some(path) = &config.clients_path {
                    if let Err(e) = sync_clients(&registry, path) {
                        tracing::warn!(path = %path.display(), error = %e, "client sync failed, keeping previous registry");
                    }
                }
            }
            _ = report_interval.tick() => report(&engine, &collector),
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }

    shutdown_tx.send(true).ok();
    collector_task.await.context("collector task")?;
    report(&engine, &collector);

    Ok(())
}

/// Converge the registry on the clients file
fn sync_clients(registry: &Registry, path: &Path) -> anyhow::Result<SyncReport> {
    let entries = load_clients(path).with_context(|| format!("reading {}", path.display()))?;
    let report = registry.sync(&entries)?;
    Ok(report)
}

/// Log what the collector gathered since the previous report
fn report(engine: &ShaperEngine, collector: &Collector) {
    let collected = collector.take();
    for (account_id, metric) in &collected.accounts {
        match serde_json::to_string(metric) {
            Ok(json) => tracing::debug!(account_id, metric = %json, "account"),
            Err(e) => tracing::debug!(account_id, error = %e, "account metric not serializable"),
        }
    }

    let stats = engine.stats().total();
    tracing::info!(
        clients = engine.registry().len(),
        accounts = collected.accounts.len(),
        destinations = collected.destinations.len(),
        packets = stats.packets,
        marked = stats.marked,
        dropped = stats.dropped(),
        unidentified = stats.unidentified,
        "shaper status"
    );
}
