//! Shaper Common - Shared types for the EDT bandwidth shaper
//!
//! This crate provides the value types every other crate agrees on:
//! - Rates (bytes per second internally, bits per second at the edges)
//! - Monotonic nanosecond clocks
//! - Error handling

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Nanoseconds per second
pub const NS_PER_SEC: u64 = 1_000_000_000;

/// Non-zero transmission rate.
///
/// Stored as bytes per second. Configuration and the registry write
/// interface speak bits per second; the conversion happens exactly once,
/// in [`Rate::from_bits_per_sec`]. Serde uses the bits-per-second form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct Rate(NonZeroU64);

impl Rate {
    /// Convert a bits-per-second ceiling. Fails when it rounds to zero bytes.
    pub fn from_bits_per_sec(bps: u64) -> ShaperResult<Self> {
        NonZeroU64::new(bps / 8)
            .map(Self)
            .ok_or(ShaperError::InvalidRate(bps))
    }

    /// Build directly from bytes per second
    pub const fn from_bytes_per_sec(bytes: NonZeroU64) -> Self {
        Self(bytes)
    }

    /// Bytes per second
    #[inline(always)]
    pub fn bytes_per_sec(&self) -> u64 {
        self.0.get()
    }

    /// Bits per second
    pub fn bits_per_sec(&self) -> u64 {
        self.0.get().saturating_mul(8)
    }

    /// Serialization time of `len` bytes at this rate, in nanoseconds
    #[inline(always)]
    pub fn delay_ns(&self, len: u64) -> u64 {
        let ns = len as u128 * NS_PER_SEC as u128 / self.0.get() as u128;
        u64::try_from(ns).unwrap_or(u64::MAX)
    }
}

impl TryFrom<u64> for Rate {
    type Error = ShaperError;

    fn try_from(bps: u64) -> ShaperResult<Self> {
        Self::from_bits_per_sec(bps)
    }
}

impl From<Rate> for u64 {
    fn from(rate: Rate) -> u64 {
        rate.bits_per_sec()
    }
}

/// Monotonic nanosecond time source shared by all cores
pub trait Clock: Send + Sync {
    /// Current time in nanoseconds
    fn now_ns(&self) -> u64;
}

/// Clock backed by [`Instant`], counting from its creation
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    origin: Instant,
}

impl MonotonicClock {
    /// Create a clock starting at zero now
    pub fn new() -> Self {
        Self { origin: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    #[inline(always)]
    fn now_ns(&self) -> u64 {
        self.origin.elapsed().as_nanos() as u64
    }
}

/// Manually driven clock for replay and tests
#[derive(Debug, Default)]
pub struct ManualClock(AtomicU64);

impl ManualClock {
    /// Create a clock reading `ns`
    pub const fn new(ns: u64) -> Self {
        Self(AtomicU64::new(ns))
    }

    /// Jump to `ns`
    pub fn set(&self, ns: u64) {
        self.0.store(ns, Ordering::Release);
    }

    /// Move forward by `ns`
    pub fn advance(&self, ns: u64) {
        self.0.fetch_add(ns, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    #[inline(always)]
    fn now_ns(&self) -> u64 {
        self.0.load(Ordering::Acquire)
    }
}
