//! Earliest Departure Time Pacing
//!
//! Each key owns one timestamp: the departure time granted to its most
//! recent packet. A new packet is charged its serialization time at the
//! key's rate on top of that timestamp.
//!
//! ```text
//!   candidate = last_departure + len / rate
//!
//!   candidate <= now            -> Forward, last = now
//!   now < candidate < now + ecn -> Forward at candidate
//!   now + ecn <= candidate < hz -> Forward at candidate, mark CE
//!   candidate >= now + horizon  -> Drop, last unchanged
//! ```
//!
//! Nothing is queued here. A downstream stage holds the packet until the
//! stamped departure time.

use crate::classify::Direction;
use crate::store::{BoundedMap, UpdateMode};
use serde::{Deserialize, Serialize};
use shaper_common::Rate;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Maximum delay we are willing to add; beyond it packets are dropped
pub const TIME_HORIZON_NS: u64 = 2_000 * 1_000 * 1_000;

/// Delay at which packets start being marked congestion-experienced
pub const ECN_HORIZON_NS: u64 = 5 * 1_000 * 1_000;

/// Key into the pacing state.
///
/// Region tags keep accounts, clients and source addresses apart, and the
/// direction bit keeps the two directions of one account apart. No tagged
/// key equals [`PacingKey::FALLBACK`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct PacingKey(u64);

impl PacingKey {
    /// Bucket for traffic that cannot be attributed to a client
    pub const FALLBACK: Self = Self(0);

    const OUTBOUND: u64 = 1 << 32;
    const ACCOUNT_TAG: u64 = 1 << 40;
    const CLIENT_TAG: u64 = 1 << 41;
    const SOURCE_TAG: u64 = 1 << 42;

    #[inline(always)]
    const fn direction_bit(direction: Direction) -> u64 {
        match direction {
            Direction::Inbound => 0,
            Direction::Outbound => Self::OUTBOUND,
        }
    }

    /// One bucket per (account, direction)
    #[inline(always)]
    pub const fn account(account_id: u32, direction: Direction) -> Self {
        Self(Self::ACCOUNT_TAG | Self::direction_bit(direction) | account_id as u64)
    }

    /// One bucket per (client, direction)
    #[inline(always)]
    pub const fn client(client_id: u32, direction: Direction) -> Self {
        Self(Self::CLIENT_TAG | Self::direction_bit(direction) | client_id as u64)
    }

    /// One bucket per source address
    #[inline(always)]
    pub const fn source(addr: Ipv4Addr) -> Self {
        Self(Self::SOURCE_TAG | u32::from_be_bytes(addr.octets()) as u64)
    }

}

/// Pacing decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Send (now or at the stamped time)
    Forward,
    /// Send at the stamped time with congestion experienced set
    ForwardAndMark,
    /// Discard
    Drop,
}

/// Why a packet was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Required delay reached the time horizon
    Horizon,
    /// Updated state could not be persisted
    StoreFailure,
}

/// Outcome of [`Pacer::admit`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Forward
    Forward {
        /// `None` when the packet may leave now
        departure_ns: Option<u64>,
    },
    /// Forward at `departure_ns` and mark congestion experienced
    ForwardAndMark {
        /// Stamped departure time
        departure_ns: u64,
    },
    /// Drop
    Drop(DropReason),
}

impl Admission {
    /// Collapse to the three-way decision
    pub fn decision(&self) -> Decision {
        match self {
            Admission::Forward { .. } => Decision::Forward,
            Admission::ForwardAndMark { .. } => Decision::ForwardAndMark,
            Admission::Drop(_) => Decision::Drop,
        }
    }

    /// Stamped departure time, if any
    pub fn departure_ns(&self) -> Option<u64> {
        match *self {
            Admission::Forward { departure_ns } => departure_ns,
            Admission::ForwardAndMark { departure_ns } => Some(departure_ns),
            Admission::Drop(_) => None,
        }
    }
}

/// Consistency of the read-decide-write sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PacingMode {
    /// Lookup, decide, write. Concurrent packets on one key may decide on
    /// the same timestamp, each race over-admitting by one packet's delay.
    /// The stored timestamp still never moves backwards.
    #[default]
    BestEffort,
    /// Decide under the entry lock; concurrent packets on one key are
    /// charged one after another.
    Serialized,
}

/// Delay thresholds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Horizons {
    /// Queued delay at or above which packets are dropped
    pub drop_ns: u64,
    /// Queued delay at or above which packets are marked
    pub ecn_ns: u64,
}

impl Default for Horizons {
    fn default() -> Self {
        Self {
            drop_ns: TIME_HORIZON_NS,
            ecn_ns: ECN_HORIZON_NS,
        }
    }
}

/// State write implied by a decision
type Write = Option<(u64, UpdateMode)>;

/// EDT pacing engine
pub struct Pacer {
    state: Arc<BoundedMap<PacingKey, u64>>,
    horizons: Horizons,
    mode: PacingMode,
}

impl Pacer {
    /// Create a pacer over `state`
    pub fn new(state: Arc<BoundedMap<PacingKey, u64>>, horizons: Horizons, mode: PacingMode) -> Self {
        Self {
            state,
            horizons,
            mode,
        }
    }

    /// Admit a packet of `len` bytes at `now_ns` against `key` paced at `rate`
    #[inline]
    pub fn admit(&self, key: PacingKey, rate: Rate, len: u64, now_ns: u64) -> Admission {
        let delay_ns = rate.delay_ns(len);

        match self.mode {
            PacingMode::BestEffort => {
                let last = self.state.get(&key);
                let (admission, write) = self.decide(last, delay_ns, now_ns);
                if let Some((tstamp, mode)) = write {
                    if !self.advance(key, tstamp, mode) {
                        return Admission::Drop(DropReason::StoreFailure);
                    }
                }
                admission
            }
            PacingMode::Serialized => {
                let mut outcome = None;
                let stored = self.state.update_with(key, |last| {
                    let (admission, write) = self.decide(last, delay_ns, now_ns);
                    outcome = Some(admission);
                    write.map(|(tstamp, _)| tstamp)
                });
                match (stored, outcome) {
                    (Ok(_), Some(admission)) => admission,
                    _ => Admission::Drop(DropReason::StoreFailure),
                }
            }
        }
    }

    /// Store `tstamp` unless a racing packet already stored a later one
    #[inline(always)]
    fn advance(&self, key: PacingKey, tstamp: u64, mode: UpdateMode) -> bool {
        let mut missing = false;
        let stored = self.state.update_with(key, |current| match current {
            Some(current) => Some(current.max(tstamp)),
            None if mode == UpdateMode::Exist => {
                missing = true;
                None
            }
            None => Some(tstamp),
        });
        stored.is_ok() && !missing
    }

    #[inline(always)]
    fn decide(&self, last: Option<u64>, delay_ns: u64, now: u64) -> (Admission, Write) {
        let candidate = match last {
            Some(last) => last.saturating_add(delay_ns),
            None => 0,
        };

        // No backlog past now
        if candidate <= now {
            return (Admission::Forward { departure_ns: None }, Some((now, UpdateMode::Any)));
        }

        let queued = candidate - now;

        // Do not queue past the time horizon
        if queued >= self.horizons.drop_ns {
            return (Admission::Drop(DropReason::Horizon), None);
        }

        let admission = if queued >= self.horizons.ecn_ns {
            Admission::ForwardAndMark { departure_ns: candidate }
        } else {
            Admission::Forward { departure_ns: Some(candidate) }
        };

        // A backlog implies an entry; if it vanished meanwhile, drop
        (admission, Some((candidate, UpdateMode::Exist)))
    }

    /// Forget keys idle for longer than `idle_ns`.
    ///
    /// An evicted key behaves exactly like an idle one on its next packet.
    pub fn evict_idle(&self, now_ns: u64, idle_ns: u64) -> usize {
        let removed = self
            .state
            .retain(|_, last| last.saturating_add(idle_ns) >= now_ns);
        if removed > 0 {
            tracing::debug!(removed, remaining = self.state.len(), "evicted idle pacing keys");
        }
        removed
    }

    /// Last granted departure for `key`
    pub fn last_departure(&self, key: &PacingKey) -> Option<u64> {
        self.state.get(key)
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.state.len()
    }

    /// Check if no key is tracked
    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// Occupancy of the pacing state as a fraction of its capacity
    pub fn load_factor(&self) -> f64 {
        self.state.load_factor()
    }
}
