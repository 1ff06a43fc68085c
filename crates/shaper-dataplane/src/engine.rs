//! Shaper Engine
//!
//! The per-packet entry point:
//!
//! ```text
//! frame → classify → (key, rate) → admit → stamp / mark → account
//! ```
//!
//! Run-to-completion on whichever core delivered the packet. Nothing here
//! blocks beyond the state store's per-entry lock.

use crate::accounting::{Accounting, DestinationKey};
use crate::classify::{set_ecn_ce, Attribution, Classification, Classifier, Direction};
use crate::config::{KeyStrategy, ShaperConfig};
use crate::pacing::{Admission, DropReason, Pacer, PacingKey};
use crate::registry::{ClientRecord, Registry};
use crate::stats::{AggregateStats, CoreStats};
use crate::store::BoundedMap;
use shaper_common::{Clock, Rate, ShaperResult};
use std::sync::Arc;

/// Host view of one packet
#[derive(Debug)]
pub struct Packet<'a> {
    /// Frame bytes; the IPv4 header may be rewritten when marking
    pub data: &'a mut [u8],
    /// Bytes billed against the rate
    pub wire_len: u64,
    /// Earliest departure time, nanoseconds on the engine clock
    pub tstamp_ns: u64,
    /// Set when the packet leaves congestion-experienced
    pub congestion_experienced: bool,
    /// Processing unit that received the packet
    pub cpu: usize,
}

impl<'a> Packet<'a> {
    /// Packet billed at its frame length
    pub fn new(data: &'a mut [u8], cpu: usize) -> Self {
        let wire_len = data.len() as u64;
        Self {
            data,
            wire_len,
            tstamp_ns: 0,
            congestion_experienced: false,
            cpu,
        }
    }

    /// Bill `wire_len` bytes instead of the frame length
    pub fn with_wire_len(mut self, wire_len: u64) -> Self {
        self.wire_len = wire_len;
        self
    }
}

/// What the host does with the packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Pass on (possibly with a departure time and CE mark)
    Forward,
    /// Discard
    Drop,
}

/// Bandwidth shaper
pub struct ShaperEngine {
    config: ShaperConfig,
    registry: Arc<Registry>,
    classifier: Classifier,
    pacer: Pacer,
    accounting: Arc<Accounting>,
    stats: Arc<AggregateStats>,
    clock: Arc<dyn Clock>,
}

impl ShaperEngine {
    /// Build an engine over `registry`, reading time from `clock`
    pub fn new(config: ShaperConfig, registry: Arc<Registry>, clock: Arc<dyn Clock>) -> ShaperResult<Self> {
        config.validate()?;

        let state = Arc::new(BoundedMap::new(config.pacing_capacity));
        let pacer = Pacer::new(state, config.horizons, config.pacing_mode);
        let classifier = Classifier::new(registry.clone(), config.link_layer);
        let accounting = Arc::new(Accounting::new(
            config.num_cores,
            config.account_capacity,
            config.effective_audit_capacity(),
        ));
        let stats = Arc::new(AggregateStats::new(config.num_cores));

        tracing::info!(
            cores = config.num_cores,
            strategy = ?config.key_strategy,
            mode = ?config.pacing_mode,
            default_bps = config.default_rate.bits_per_sec(),
            "shaper engine ready"
        );

        Ok(Self {
            config,
            registry,
            classifier,
            pacer,
            accounting,
            stats,
            clock,
        })
    }

    /// Decide the fate of one packet, stamping and marking it in place
    #[inline]
    pub fn handle(&self, packet: &mut Packet<'_>) -> Verdict {
        let stats = self.stats.core(packet.cpu);
        stats.record_packet();

        let classification = match self.config.key_strategy {
            KeyStrategy::Global => Classification {
                attribution: Attribution::Unidentified,
                length: packet.data.len() as u64,
                header: self.classifier.parse(packet.data),
            },
            _ => self.classifier.classify(packet.data),
        };

        let (key, rate) = self.select(&classification, stats);
        let now = self.clock.now_ns();

        match self.pacer.admit(key, rate, packet.wire_len, now) {
            Admission::Drop(DropReason::Horizon) => {
                stats.record_horizon_drop();
                return Verdict::Drop;
            }
            Admission::Drop(DropReason::StoreFailure) => {
                stats.record_store_drop();
                return Verdict::Drop;
            }
            Admission::Forward { departure_ns } => {
                if let Some(departure_ns) = departure_ns {
                    packet.tstamp_ns = departure_ns;
                }
                stats.record_forward();
            }
            Admission::ForwardAndMark { departure_ns } => {
                packet.tstamp_ns = departure_ns;
                packet.congestion_experienced = true;
                if let Some(header) = classification.header {
                    set_ecn_ce(packet.data, header.l3_offset);
                }
                stats.record_mark();
            }
        }

        if let Attribution::Client { record, direction } = classification.attribution {
            self.account(packet, &classification, record, direction, stats);
        }

        Verdict::Forward
    }

    /// Pacing key and rate for a classified packet
    #[inline(always)]
    fn select(&self, classification: &Classification, stats: &CoreStats) -> (PacingKey, Rate) {
        let default_rate = self.config.default_rate;

        match classification.attribution {
            Attribution::Client { record, direction } => {
                let key = match self.config.key_strategy {
                    KeyStrategy::PerClientDirection => PacingKey::client(record.client_id, direction),
                    _ => PacingKey::account(record.account_id, direction),
                };
                (key, record.rate(direction))
            }
            Attribution::Unidentified => match (self.config.key_strategy, classification.header) {
                (KeyStrategy::Global, Some(header)) => (PacingKey::source(header.src), default_rate),
                _ => {
                    stats.record_unidentified(classification.is_malformed());
                    (PacingKey::FALLBACK, default_rate)
                }
            },
        }
    }

    #[inline(always)]
    fn account(
        &self,
        packet: &Packet<'_>,
        classification: &Classification,
        record: ClientRecord,
        direction: Direction,
        stats: &CoreStats,
    ) {
        if self
            .accounting
            .record(packet.cpu, record.account_id, direction, packet.wire_len)
            .is_err()
        {
            stats.record_accounting_overflow();
        }

        if !self.accounting.audits_destinations() {
            return;
        }
        if let Some((remote_addr, remote_port)) = classification.remote() {
            let key = DestinationKey {
                client_id: record.client_id,
                remote_addr,
                remote_port,
            };
            if self
                .accounting
                .record_destination(packet.cpu, key, direction, packet.wire_len)
                .is_err()
            {
                stats.record_accounting_overflow();
            }
        }
    }

    /// Current engine time
    pub fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    /// Configuration in effect
    pub fn config(&self) -> &ShaperConfig {
        &self.config
    }

    /// Client registry
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Pacing engine
    pub fn pacer(&self) -> &Pacer {
        &self.pacer
    }

    /// Account counters
    pub fn accounting(&self) -> &Arc<Accounting> {
        &self.accounting
    }

    /// Packet outcome counters
    pub fn stats(&self) -> &Arc<AggregateStats> {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classify::tests::make_packet;
    use crate::classify::LinkLayer;
    use crate::pacing::PacingMode;
    use shaper_common::ManualClock;
    use std::net::Ipv4Addr;

    const CLIENT: [u8; 4] = [10, 8, 0, 2];
    const REMOTE: [u8; 4] = [1, 1, 1, 1];
    const ECT0: u8 = 0x02;

    fn engine_with(config: ShaperConfig, registry: Registry) -> (ShaperEngine, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let engine = ShaperEngine::new(config, Arc::new(registry), clock.clone()).unwrap();
        (engine, clock)
    }

    fn config(strategy: KeyStrategy) -> ShaperConfig {
        ShaperConfig {
            num_cores: 2,
            key_strategy: strategy,
            pacing_capacity: 1024,
            account_capacity: 1024,
            audit_capacity: 1024,
            ..Default::default()
        }
    }

    fn one_client(bps: u64) -> Registry {
        let registry = Registry::new();
        registry
            .set_client(Ipv4Addr::from(CLIENT), 1, 7, bps, bps)
            .unwrap();
        registry
    }

    fn send(engine: &ShaperEngine, frame: &mut [u8], wire_len: u64) -> (Verdict, u64, bool) {
        let mut packet = Packet::new(frame, 0).with_wire_len(wire_len);
        let verdict = engine.handle(&mut packet);
        (verdict, packet.tstamp_ns, packet.congestion_experienced)
    }

    #[test]
    fn test_back_to_back_burst() {
        let (engine, _clock) = engine_with(config(KeyStrategy::PerAccountDirection), one_client(1_000_000));

        let mut results = Vec::new();
        let mut frames = Vec::new();
        for _ in 0..3 {
            let mut frame = make_packet(CLIENT, REMOTE, ECT0);
            results.push(send(&engine, &mut frame, 1250));
            frames.push(frame);
        }

        assert_eq!(results[0], (Verdict::Forward, 0, false));
        assert_eq!(results[1], (Verdict::Forward, 10_000_000, true));
        assert_eq!(results[2], (Verdict::Forward, 20_000_000, true));

        // Marked packets carry CE in the header
        assert_eq!(frames[0][1] & 0x03, ECT0);
        assert_eq!(frames[1][1] & 0x03, 0x03);
        assert_eq!(frames[2][1] & 0x03, 0x03);

        let metric = engine.accounting().read(7, false);
        assert_eq!(metric.bytes_out, 3750);
        assert_eq!(metric.packets_out, 3);
        assert_eq!(metric.bytes_in, 0);

        let stats = engine.stats().total();
        assert_eq!(stats.packets, 3);
        assert_eq!(stats.forwarded, 3);
        assert_eq!(stats.marked, 2);
    }

    #[test]
    fn test_idle_flow_forwards_without_stamp() {
        let (engine, clock) = engine_with(config(KeyStrategy::PerAccountDirection), one_client(1_000_000));

        let mut frame = make_packet(CLIENT, REMOTE, ECT0);
        send(&engine, &mut frame, 1250);

        clock.set(50_000_000);
        let (verdict, tstamp, marked) = send(&engine, &mut frame, 1250);
        assert_eq!((verdict, tstamp, marked), (Verdict::Forward, 0, false));
        assert_eq!(
            engine
                .pacer()
                .last_departure(&PacingKey::account(7, Direction::Outbound)),
            Some(50_000_000)
        );
    }

    #[test]
    fn test_horizon_drop_skips_accounting() {
        // 1000 bytes/s: a 1500-byte packet costs 1.5s
        let (engine, _clock) = engine_with(config(KeyStrategy::PerAccountDirection), one_client(8_000));
        let key = PacingKey::account(7, Direction::Outbound);

        let mut frame = make_packet(CLIENT, REMOTE, ECT0);
        assert_eq!(send(&engine, &mut frame, 1500).0, Verdict::Forward);
        assert_eq!(send(&engine, &mut frame, 1500), (Verdict::Forward, 1_500_000_000, true));
        assert_eq!(send(&engine, &mut frame, 1500).0, Verdict::Drop);

        assert_eq!(engine.pacer().last_departure(&key), Some(1_500_000_000));
        let metric = engine.accounting().read(7, false);
        assert_eq!(metric.bytes_out, 3000);
        assert_eq!(metric.packets_out, 2);
        assert_eq!(engine.stats().total().dropped_horizon, 1);
    }

    #[test]
    fn test_unidentified_share_fallback() {
        let (engine, _clock) = engine_with(config(KeyStrategy::PerAccountDirection), Registry::new());

        let sources = [[192, 0, 2, 1], [192, 0, 2, 2], [198, 51, 100, 7]];
        let mut marks = Vec::new();
        for src in sources {
            let mut frame = make_packet(src, REMOTE, 0);
            marks.push(send(&engine, &mut frame, 1250).2);
        }

        // Default 1 Mbit/s shared by all three sources
        assert_eq!(marks, vec![false, true, true]);
        assert_eq!(engine.pacer().last_departure(&PacingKey::FALLBACK), Some(20_000_000));
        assert_eq!(engine.stats().total().unidentified, 3);
        assert!(engine.accounting().drain_accounts().is_empty());
    }

    #[test]
    fn test_malformed_goes_to_fallback() {
        let (engine, _clock) = engine_with(config(KeyStrategy::PerAccountDirection), one_client(1_000_000));

        let mut ipv6 = make_packet(CLIENT, REMOTE, 0);
        ipv6[0] = 0x60;
        let mut short = vec![0x45u8; 10];

        assert_eq!(send(&engine, &mut ipv6, 1250).0, Verdict::Forward);
        assert_eq!(send(&engine, &mut short, 1250), (Verdict::Forward, 10_000_000, true));
        // Frame left alone: no header to rewrite
        assert_eq!(short, vec![0x45u8; 10]);

        let stats = engine.stats().total();
        assert_eq!(stats.unidentified, 2);
        assert_eq!(stats.malformed, 2);
        assert!(engine.pacer().last_departure(&PacingKey::FALLBACK).is_some());
    }

    #[test]
    fn test_directions_paced_apart() {
        let (engine, _clock) = engine_with(config(KeyStrategy::PerAccountDirection), one_client(1_000_000));

        let mut outbound = make_packet(CLIENT, REMOTE, 0);
        let mut inbound = make_packet(REMOTE, CLIENT, 0);
        send(&engine, &mut outbound, 1250);
        let (_, tstamp, marked) = send(&engine, &mut inbound, 1250);

        assert_eq!((tstamp, marked), (0, false));
        let metric = engine.accounting().read(7, false);
        assert_eq!((metric.bytes_in, metric.bytes_out), (1250, 1250));
    }

    #[test]
    fn test_account_versus_client_keys() {
        let registry = || {
            let registry = Registry::new();
            registry
                .set_client(Ipv4Addr::new(10, 8, 0, 2), 1, 7, 1_000_000, 1_000_000)
                .unwrap();
            registry
                .set_client(Ipv4Addr::new(10, 8, 0, 3), 2, 7, 1_000_000, 1_000_000)
                .unwrap();
            registry
        };

        let burst = |engine: &ShaperEngine| {
            let mut a = make_packet([10, 8, 0, 2], REMOTE, 0);
            let mut b = make_packet([10, 8, 0, 3], REMOTE, 0);
            send(engine, &mut a, 1250);
            send(engine, &mut b, 1250).2
        };

        // Same account, one shared bucket
        let (engine, _clock) = engine_with(config(KeyStrategy::PerAccountDirection), registry());
        assert!(burst(&engine));

        // Separate buckets per client
        let (engine, _clock) = engine_with(config(KeyStrategy::PerClientDirection), registry());
        assert!(!burst(&engine));
        assert!(engine
            .pacer()
            .last_departure(&PacingKey::client(2, Direction::Outbound))
            .is_some());
        assert_eq!(engine.accounting().read(7, false).packets_out, 2);
    }

    #[test]
    fn test_global_strategy_keys_by_source() {
        let (engine, _clock) = engine_with(config(KeyStrategy::Global), one_client(8_000));

        let mut a = make_packet(CLIENT, REMOTE, 0);
        let mut b = make_packet([192, 0, 2, 1], REMOTE, 0);
        send(&engine, &mut a, 1250);
        assert!(send(&engine, &mut a, 1250).2);
        assert!(!send(&engine, &mut b, 1250).2);

        // Registry rate (1000 B/s) not consulted: default rate applies
        assert_eq!(
            engine
                .pacer()
                .last_departure(&PacingKey::source(Ipv4Addr::from(CLIENT))),
            Some(10_000_000)
        );
        assert!(engine.accounting().drain_accounts().is_empty());
        assert_eq!(engine.stats().total().unidentified, 0);
    }

    #[test]
    fn test_store_full_drops() {
        let config = ShaperConfig {
            pacing_capacity: 1,
            ..config(KeyStrategy::Global)
        };
        let (engine, _clock) = engine_with(config, Registry::new());

        let mut a = make_packet([192, 0, 2, 1], REMOTE, 0);
        let mut b = make_packet([192, 0, 2, 2], REMOTE, 0);
        assert_eq!(send(&engine, &mut a, 100).0, Verdict::Forward);
        assert_eq!(send(&engine, &mut b, 100).0, Verdict::Drop);
        assert_eq!(engine.stats().total().dropped_store, 1);
    }

    #[test]
    fn test_mark_without_ect_sets_flag_only() {
        let (engine, _clock) = engine_with(config(KeyStrategy::PerAccountDirection), one_client(1_000_000));

        let mut first = make_packet(CLIENT, REMOTE, 0);
        let mut second = make_packet(CLIENT, REMOTE, 0);
        let original = second.clone();
        send(&engine, &mut first, 1250);

        assert!(send(&engine, &mut second, 1250).2);
        assert_eq!(second, original);
    }

    #[test]
    fn test_ethernet_frames() {
        let config = ShaperConfig {
            link_layer: LinkLayer::Ethernet,
            ..config(KeyStrategy::PerAccountDirection)
        };
        let (engine, _clock) = engine_with(config, one_client(1_000_000));

        let mut frame = vec![0u8; 14];
        frame[12] = 0x08;
        frame.extend_from_slice(&make_packet(CLIENT, REMOTE, ECT0));
        let mut second = frame.clone();

        send(&engine, &mut frame, 1250);
        assert!(send(&engine, &mut second, 1250).2);
        assert_eq!(second[14 + 1] & 0x03, 0x03);
        assert_eq!(engine.accounting().read(7, false).packets_out, 2);
    }

    #[test]
    fn test_destination_audit() {
        let config = ShaperConfig {
            audit_destinations: true,
            ..config(KeyStrategy::PerAccountDirection)
        };
        let (engine, _clock) = engine_with(config, one_client(1_000_000));

        let mut out = make_packet(CLIENT, REMOTE, 0);
        let mut back = make_packet(REMOTE, CLIENT, 0);
        send(&engine, &mut out, 1000);
        send(&engine, &mut back, 3000);

        let destinations = engine.accounting().drain_destinations();
        let outbound = DestinationKey {
            client_id: 1,
            remote_addr: Ipv4Addr::from(REMOTE),
            remote_port: 443,
        };
        let inbound = DestinationKey {
            remote_port: 12345,
            ..outbound
        };
        assert_eq!(destinations[&outbound].bytes_out, 1000);
        assert_eq!(destinations[&inbound].bytes_in, 3000);
    }

    #[test]
    fn test_serialized_mode_matches() {
        let config = ShaperConfig {
            pacing_mode: PacingMode::Serialized,
            ..config(KeyStrategy::PerAccountDirection)
        };
        let (engine, _clock) = engine_with(config, one_client(1_000_000));

        let mut frame = make_packet(CLIENT, REMOTE, ECT0);
        let stamps: Vec<u64> = (0..3).map(|_| send(&engine, &mut frame, 1250).1).collect();
        assert_eq!(stamps, vec![0, 10_000_000, 20_000_000]);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ShaperConfig {
            num_cores: 0,
            ..Default::default()
        };
        let clock = Arc::new(ManualClock::new(0));
        assert!(ShaperEngine::new(config, Arc::new(Registry::new()), clock).is_err());
    }
}
