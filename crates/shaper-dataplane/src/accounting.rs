//! Per-Account Traffic Accounting
//!
//! Byte and packet counters per account, partitioned per core so that the
//! packet path never contends on a shared counter. Readers sum across the
//! partitions; taking a reading with reset removes the entry from each
//! partition under its lock, so an increment racing with the reset lands
//! either in the returned total or in a fresh entry, never nowhere.

use crate::classify::Direction;
use crate::store::BoundedMap;
use serde::Serialize;
use shaper_common::ShaperResult;
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Counters for one account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AccountMetric {
    /// Bytes towards the account's clients
    pub bytes_in: u64,
    /// Bytes from the account's clients
    pub bytes_out: u64,
    /// Packets towards the account's clients
    pub packets_in: u64,
    /// Packets from the account's clients
    pub packets_out: u64,
}

impl AccountMetric {
    #[inline(always)]
    fn record(&mut self, direction: Direction, len: u64) {
        match direction {
            Direction::Inbound => {
                self.bytes_in = self.bytes_in.wrapping_add(len);
                self.packets_in = self.packets_in.wrapping_add(1);
            }
            Direction::Outbound => {
                self.bytes_out = self.bytes_out.wrapping_add(len);
                self.packets_out = self.packets_out.wrapping_add(1);
            }
        }
    }

    /// Add another reading
    pub fn merge(&mut self, other: &AccountMetric) {
        self.bytes_in = self.bytes_in.wrapping_add(other.bytes_in);
        self.bytes_out = self.bytes_out.wrapping_add(other.bytes_out);
        self.packets_in = self.packets_in.wrapping_add(other.packets_in);
        self.packets_out = self.packets_out.wrapping_add(other.packets_out);
    }
}

/// Remote endpoint of one client's traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct DestinationKey {
    /// Client identity
    pub client_id: u32,
    /// Address on the far side
    pub remote_addr: Ipv4Addr,
    /// TCP port on the far side, 0 if unknown
    pub remote_port: u16,
}

/// Byte counters for one destination
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DestinationMetric {
    /// Bytes towards the client
    pub bytes_in: u64,
    /// Bytes from the client
    pub bytes_out: u64,
}

impl DestinationMetric {
    #[inline(always)]
    fn record(&mut self, direction: Direction, len: u64) {
        match direction {
            Direction::Inbound => self.bytes_in = self.bytes_in.wrapping_add(len),
            Direction::Outbound => self.bytes_out = self.bytes_out.wrapping_add(len),
        }
    }

    /// Add another reading
    pub fn merge(&mut self, other: &DestinationMetric) {
        self.bytes_in = self.bytes_in.wrapping_add(other.bytes_in);
        self.bytes_out = self.bytes_out.wrapping_add(other.bytes_out);
    }
}

/// Per-core counter partitions
pub struct Accounting {
    accounts: Vec<BoundedMap<u32, AccountMetric>>,
    destinations: Vec<BoundedMap<DestinationKey, DestinationMetric>>,
}

impl Accounting {
    /// Create `cores` partitions of `max_accounts` entries each.
    /// Destination auditing is off when `max_destinations` is 0.
    pub fn new(cores: usize, max_accounts: usize, max_destinations: usize) -> Self {
        let cores = cores.max(1);
        let destinations = if max_destinations == 0 {
            Vec::new()
        } else {
            (0..cores).map(|_| BoundedMap::new(max_destinations)).collect()
        };

        Self {
            accounts: (0..cores).map(|_| BoundedMap::new(max_accounts)).collect(),
            destinations,
        }
    }

    /// Count an admitted packet for `account_id` on `core`
    #[inline]
    pub fn record(&self, core: usize, account_id: u32, direction: Direction, len: u64) -> ShaperResult<()> {
        let partition = &self.accounts[core % self.accounts.len()];
        partition.update_with(account_id, |current| {
            let mut metric = current.unwrap_or_default();
            metric.record(direction, len);
            Some(metric)
        })?;
        Ok(())
    }

    /// Count an admitted packet against its remote endpoint
    #[inline]
    pub fn record_destination(
        &self,
        core: usize,
        key: DestinationKey,
        direction: Direction,
        len: u64,
    ) -> ShaperResult<()> {
        if self.destinations.is_empty() {
            return Ok(());
        }
        let partition = &self.destinations[core % self.destinations.len()];
        partition.update_with(key, |current| {
            let mut metric = current.unwrap_or_default();
            metric.record(direction, len);
            Some(metric)
        })?;
        Ok(())
    }

    /// Sum one account across cores, zeroing it when `reset` is set
    pub fn read(&self, account_id: u32, reset: bool) -> AccountMetric {
        let mut total = AccountMetric::default();
        for partition in &self.accounts {
            let reading = if reset {
                partition.remove(&account_id)
            } else {
                partition.get(&account_id)
            };
            if let Some(metric) = reading {
                total.merge(&metric);
            }
        }
        total
    }

    /// Take and sum every account's counters
    pub fn drain_accounts(&self) -> HashMap<u32, AccountMetric> {
        let mut totals: HashMap<u32, AccountMetric> = HashMap::new();
        for partition in &self.accounts {
            for (account_id, metric) in partition.drain() {
                totals.entry(account_id).or_default().merge(&metric);
            }
        }
        totals
    }

    /// Take and sum every destination's counters
    pub fn drain_destinations(&self) -> HashMap<DestinationKey, DestinationMetric> {
        let mut totals: HashMap<DestinationKey, DestinationMetric> = HashMap::new();
        for partition in &self.destinations {
            for (key, metric) in partition.drain() {
                totals.entry(key).or_default().merge(&metric);
            }
        }
        totals
    }

    /// Whether destination auditing is on
    pub fn audits_destinations(&self) -> bool {
        !self.destinations.is_empty()
    }
}
