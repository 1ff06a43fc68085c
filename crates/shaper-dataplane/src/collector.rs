//! Metrics Collector
//!
//! Once per interval: drain the per-core counters into a running table,
//! publish them through the `metrics` facade, and evict idle pacing keys.
//! The table is handed out by [`Collector::take`], typically on a much
//! longer period than the drain.

use crate::accounting::{AccountMetric, DestinationKey, DestinationMetric};
use crate::engine::ShaperEngine;
use crate::stats::StatsSnapshot;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Counters accumulated since the last [`Collector::take`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectedMetrics {
    /// Per-account totals
    pub accounts: HashMap<u32, AccountMetric>,
    /// Per-destination totals; after [`Collector::take`] only those that
    /// reached the reporting threshold in at least one direction
    pub destinations: HashMap<DestinationKey, DestinationMetric>,
}

/// Outcome of one tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectReport {
    /// Accounts with traffic this tick
    pub accounts: usize,
    /// Destinations with traffic this tick
    pub destinations: usize,
    /// Pacing keys evicted
    pub evicted: usize,
}

/// Periodic drain of an engine's counters
pub struct Collector {
    engine: Arc<ShaperEngine>,
    accumulated: Mutex<CollectedMetrics>,
    last_stats: Mutex<StatsSnapshot>,
}

impl Collector {
    /// Collector over `engine`
    pub fn new(engine: Arc<ShaperEngine>) -> Self {
        Self {
            engine,
            accumulated: Mutex::new(CollectedMetrics::default()),
            last_stats: Mutex::new(StatsSnapshot::default()),
        }
    }

    /// Run one collection pass
    pub fn collect(&self) -> CollectReport {
        let config = self.engine.config();
        let accounting = self.engine.accounting();
        let mut report = CollectReport::default();

        let accounts = accounting.drain_accounts();
        let destinations = accounting.drain_destinations();

        {
            let mut accumulated = self.accumulated.lock();

            for (account_id, metric) in accounts {
                publish_account(account_id, &metric);
                accumulated.accounts.entry(account_id).or_default().merge(&metric);
                report.accounts += 1;
            }

            for (key, metric) in destinations {
                accumulated.destinations.entry(key).or_default().merge(&metric);
                report.destinations += 1;
            }
        }

        self.publish_stats();

        if config.idle_timeout_ms > 0 {
            report.evicted = self
                .engine
                .pacer()
                .evict_idle(self.engine.now_ns(), config.idle_timeout_ns());
        }
        metrics::gauge!("shaper_pacing_keys").set(self.engine.pacer().len() as f64);
        metrics::gauge!("shaper_pacing_load").set(self.engine.pacer().load_factor());

        report
    }

    /// Publish stat deltas since the previous pass
    fn publish_stats(&self) {
        let total = self.engine.stats().total();
        let previous = std::mem::replace(&mut *self.last_stats.lock(), total);

        let delta = |now: u64, before: u64| now.saturating_sub(before);
        metrics::counter!("shaper_packets_total").increment(delta(total.packets, previous.packets));
        metrics::counter!("shaper_forwarded_total").increment(delta(total.forwarded, previous.forwarded));
        metrics::counter!("shaper_marked_total").increment(delta(total.marked, previous.marked));
        metrics::counter!("shaper_dropped_total", "reason" => "horizon")
            .increment(delta(total.dropped_horizon, previous.dropped_horizon));
        metrics::counter!("shaper_dropped_total", "reason" => "store")
            .increment(delta(total.dropped_store, previous.dropped_store));
        metrics::counter!("shaper_unidentified_total")
            .increment(delta(total.unidentified, previous.unidentified));
        metrics::counter!("shaper_malformed_total").increment(delta(total.malformed, previous.malformed));

        let overflow = delta(total.accounting_overflow, previous.accounting_overflow);
        if overflow > 0 {
            tracing::warn!(overflow, "accounting partitions full, packets not counted");
        }
        let store_drops = delta(total.dropped_store, previous.dropped_store);
        if store_drops > 0 {
            tracing::warn!(
                dropped = store_drops,
                keys = self.engine.pacer().len(),
                load = self.engine.pacer().load_factor(),
                capacity = self.engine.config().pacing_capacity,
                "pacing state full, packets dropped"
            );
        }
    }

    /// Hand out the accumulated table and start a new one.
    ///
    /// Destinations below `min_audit_bytes` in both directions are left out.
    pub fn take(&self) -> CollectedMetrics {
        let mut taken = std::mem::take(&mut *self.accumulated.lock());
        let min = self.engine.config().min_audit_bytes;

        taken.destinations.retain(|key, metric| {
            let keep = metric.bytes_in >= min || metric.bytes_out >= min;
            if keep {
                tracing::debug!(
                    client_id = key.client_id,
                    remote = %key.remote_addr,
                    port = key.remote_port,
                    bytes_in = metric.bytes_in,
                    bytes_out = metric.bytes_out,
                    "destination"
                );
            }
            keep
        });
        taken
    }

    /// Collect every interval until `shutdown` flips to true
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let period = self.engine.config().collect_interval();
        tracing::info!(interval_ms = period.as_millis() as u64, "starting collector");

        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.collect();
                    tracing::trace!(?report, "collected");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            if *shutdown.borrow() {
                break;
            }
        }

        // Final pass so nothing counted is lost
        self.collect();
        tracing::info!("collector stopped");
    }
}

fn publish_account(account_id: u32, metric: &AccountMetric) {
    let account = account_id.to_string();
    metrics::counter!("shaper_account_bytes", "account" => account.clone(), "direction" => "in")
        .increment(metric.bytes_in);
    metrics::counter!("shaper_account_bytes", "account" => account.clone(), "direction" => "out")
        .increment(metric.bytes_out);
    metrics::counter!("shaper_account_packets", "account" => account.clone(), "direction" => "in")
        .increment(metric.packets_in);
    metrics::counter!("shaper_account_packets", "account" => account, "direction" => "out")
        .increment(metric.packets_out);
}
