//! Shaper Data Plane - Earliest Departure Time bandwidth shaping
//!
//! Decides, per packet and in constant time, whether it leaves now, leaves
//! later at a stamped departure time (possibly marked congestion
//! experienced), or is dropped. Nothing is queued here.
//!
//! # Architecture
//!
//! ```text
//!  packet ──► Classifier ──► (key, rate) ──► Pacer ──► Verdict
//!                │                             │
//!                ▼                             ▼
//!            Registry                  BoundedMap<PacingKey, u64>
//!                                              │
//!                    Accounting (per core) ◄───┘ on forward
//!                            │
//!                            ▼
//!                        Collector ──► metrics
//! ```
//!
//! # Key Strategies
//!
//! | Strategy | Key | Rate |
//! |----------|-----|------|
//! | `Global` | source address | default |
//! | `PerClientDirection` | (client, direction) | client's |
//! | `PerAccountDirection` | (account, direction) | client's |
//!
//! Unidentified traffic always shares the fallback key at the default rate.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod accounting;
pub mod classify;
pub mod collector;
pub mod config;
pub mod engine;
pub mod pacing;
pub mod registry;
pub mod stats;
pub mod store;

pub use accounting::{AccountMetric, Accounting, DestinationKey, DestinationMetric};
pub use classify::{Attribution, Classification, Classifier, Direction, LinkLayer};
pub use collector::{CollectReport, CollectedMetrics, Collector};
pub use config::{KeyStrategy, ShaperConfig};
pub use engine::{Packet, ShaperEngine, Verdict};
pub use pacing::{
    Admission, Decision, DropReason, Horizons, Pacer, PacingKey, PacingMode, ECN_HORIZON_NS,
    TIME_HORIZON_NS,
};
pub use registry::{load_clients, ClientEntry, ClientRecord, Registry, SyncReport};
pub use stats::{AggregateStats, StatsSnapshot};
pub use store::{BoundedMap, UpdateMode};
