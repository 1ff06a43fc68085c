//! Shaper Statistics
//!
//! Lock-free per-core counters for every packet outcome.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Per-core counters (cache-line aligned)
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct CoreStats {
    packets: AtomicU64,
    forwarded: AtomicU64,
    marked: AtomicU64,
    dropped_horizon: AtomicU64,
    dropped_store: AtomicU64,
    unidentified: AtomicU64,
    malformed: AtomicU64,
    accounting_overflow: AtomicU64,
}

impl CoreStats {
    #[inline(always)]
    pub(crate) fn record_packet(&self) {
        self.packets.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_forward(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_mark(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        self.marked.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_horizon_drop(&self) {
        self.dropped_horizon.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_store_drop(&self) {
        self.dropped_store.fetch_add(1, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn record_unidentified(&self, malformed: bool) {
        self.unidentified.fetch_add(1, Ordering::Relaxed);
        if malformed {
            self.malformed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline(always)]
    pub(crate) fn record_accounting_overflow(&self) {
        self.accounting_overflow.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            packets: self.packets.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            marked: self.marked.load(Ordering::Relaxed),
            dropped_horizon: self.dropped_horizon.load(Ordering::Relaxed),
            dropped_store: self.dropped_store.load(Ordering::Relaxed),
            unidentified: self.unidentified.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            accounting_overflow: self.accounting_overflow.load(Ordering::Relaxed),
        }
    }
}

/// Stats snapshot (non-atomic)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// Packets handled
    pub packets: u64,
    /// Packets forwarded, marked ones included
    pub forwarded: u64,
    /// Packets forwarded with congestion experienced
    pub marked: u64,
    /// Packets dropped past the time horizon
    pub dropped_horizon: u64,
    /// Packets dropped because pacing state could not be written
    pub dropped_store: u64,
    /// Packets charged to the fallback bucket
    pub unidentified: u64,
    /// Unidentified packets without a parsable IPv4 header
    pub malformed: u64,
    /// Forwarded packets whose account partition was full
    pub accounting_overflow: u64,
}

impl StatsSnapshot {
    /// All drops
    pub fn dropped(&self) -> u64 {
        self.dropped_horizon + self.dropped_store
    }

    /// Fraction of forwarded packets that were marked
    pub fn mark_ratio(&self) -> f64 {
        if self.forwarded == 0 {
            return 0.0;
        }
        self.marked as f64 / self.forwarded as f64
    }

    fn merge(&mut self, other: &StatsSnapshot) {
        self.packets += other.packets;
        self.forwarded += other.forwarded;
        self.marked += other.marked;
        self.dropped_horizon += other.dropped_horizon;
        self.dropped_store += other.dropped_store;
        self.unidentified += other.unidentified;
        self.malformed += other.malformed;
        self.accounting_overflow += other.accounting_overflow;
    }
}

/// Aggregate stats across all cores
#[derive(Debug)]
pub struct AggregateStats {
    cores: Vec<CoreStats>,
}

impl AggregateStats {
    /// One counter block per core
    pub fn new(num_cores: usize) -> Self {
        let cores = (0..num_cores.max(1)).map(|_| CoreStats::default()).collect();
        Self { cores }
    }

    /// Counters of core `idx`, wrapping past the core count
    #[inline(always)]
    pub fn core(&self, idx: usize) -> &CoreStats {
        &self.cores[idx % self.cores.len()]
    }

    /// Sum over every core
    pub fn total(&self) -> StatsSnapshot {
        let mut total = StatsSnapshot::default();
        for core in &self.cores {
            total.merge(&core.snapshot());
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_core_stats() {
        let stats = CoreStats::default();
        stats.record_packet();
        stats.record_packet();
        stats.record_forward();
        stats.record_mark();

        let snap = stats.snapshot();
        assert_eq!(snap.packets, 2);
        assert_eq!(snap.forwarded, 2);
        assert_eq!(snap.marked, 1);
        assert_eq!(snap.mark_ratio(), 0.5);
    }

    #[test]
    fn test_unidentified_and_malformed() {
        let stats = CoreStats::default();
        stats.record_unidentified(false);
        stats.record_unidentified(true);

        let snap = stats.snapshot();
        assert_eq!(snap.unidentified, 2);
        assert_eq!(snap.malformed, 1);
    }

    #[test]
    fn test_aggregate() {
        let agg = AggregateStats::new(4);
        agg.core(0).record_horizon_drop();
        agg.core(1).record_store_drop();
        agg.core(6).record_forward();

        let total = agg.total();
        assert_eq!(total.dropped(), 2);
        assert_eq!(total.forwarded, 1);
        assert_eq!(agg.core(2).snapshot().forwarded, 1);
    }

    #[test]
    fn test_cache_line_aligned() {
        assert_eq!(std::mem::align_of::<CoreStats>(), 64);
    }
}
