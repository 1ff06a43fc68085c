//! Client Registry
//!
//! Address → client/account record, written by the control plane and read
//! by every packet. Each record is replaced whole, so readers never see a
//! half-written rate pair.

use crate::classify::Direction;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use shaper_common::{Rate, ShaperError, ShaperResult};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::Path;

/// Rates and identity of one client address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientRecord {
    /// Client identity
    pub client_id: u32,
    /// Account the client belongs to (shared limits and counters)
    pub account_id: u32,
    /// Ceiling for traffic towards the client
    pub inbound_rate: Rate,
    /// Ceiling for traffic from the client
    pub outbound_rate: Rate,
}

impl ClientRecord {
    /// Ceiling for traffic in `direction`
    #[inline(always)]
    pub fn rate(&self, direction: Direction) -> Rate {
        match direction {
            Direction::Inbound => self.inbound_rate,
            Direction::Outbound => self.outbound_rate,
        }
    }
}

/// Serialized registry entry, rates in bits per second
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEntry {
    /// Client address, dotted quad
    pub address: String,
    /// Client identity
    pub client_id: u32,
    /// Account identity
    pub account_id: u32,
    /// Inbound ceiling, bit/s
    pub inbound_bps: u64,
    /// Outbound ceiling, bit/s
    pub outbound_bps: u64,
}

impl ClientEntry {
    /// Parsed client address
    pub fn addr(&self) -> ShaperResult<Ipv4Addr> {
        self.address
            .trim()
            .parse()
            .map_err(|_| ShaperError::InvalidAddress(self.address.clone()))
    }

    /// Validate and convert to a record
    pub fn record(&self) -> ShaperResult<ClientRecord> {
        Ok(ClientRecord {
            client_id: self.client_id,
            account_id: self.account_id,
            inbound_rate: Rate::from_bits_per_sec(self.inbound_bps)?,
            outbound_rate: Rate::from_bits_per_sec(self.outbound_bps)?,
        })
    }
}

/// Load entries from a JSON array on disk
pub fn load_clients(path: impl AsRef<Path>) -> ShaperResult<Vec<ClientEntry>> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&content)?)
}

/// Outcome of [`Registry::sync`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// New addresses
    pub added: usize,
    /// Addresses whose record changed
    pub updated: usize,
    /// Addresses no longer present
    pub removed: usize,
    /// Addresses left as they were
    pub unchanged: usize,
}

/// Concurrent client registry
#[derive(Debug, Default)]
pub struct Registry {
    clients: DashMap<Ipv4Addr, ClientRecord>,
}

impl Registry {
    /// Create empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Lookup client by address
    #[inline]
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<ClientRecord> {
        self.clients.get(&addr).map(|r| *r)
    }

    /// Insert or replace a client. Rates are bits per second and must
    /// amount to at least one byte per second.
    pub fn set_client(
        &self,
        addr: Ipv4Addr,
        client_id: u32,
        account_id: u32,
        inbound_bps: u64,
        outbound_bps: u64,
    ) -> ShaperResult<()> {
        let record = ClientRecord {
            client_id,
            account_id,
            inbound_rate: Rate::from_bits_per_sec(inbound_bps)?,
            outbound_rate: Rate::from_bits_per_sec(outbound_bps)?,
        };
        self.clients.insert(addr, record);
        tracing::debug!(%addr, client_id, account_id, inbound_bps, outbound_bps, "client set");
        Ok(())
    }

    /// Remove a client
    pub fn remove_client(&self, addr: Ipv4Addr) -> Option<ClientRecord> {
        let removed = self.clients.remove(&addr).map(|(_, r)| r);
        if removed.is_some() {
            tracing::debug!(%addr, "client removed");
        }
        removed
    }

    /// Converge on `entries`: write changed records, drop absent ones.
    ///
    /// Every entry is validated before anything is written, so an invalid
    /// snapshot leaves the registry untouched.
    pub fn sync(&self, entries: &[ClientEntry]) -> ShaperResult<SyncReport> {
        let desired = entries
            .iter()
            .map(|e| -> ShaperResult<(Ipv4Addr, ClientRecord)> { Ok((e.addr()?, e.record()?)) })
            .collect::<ShaperResult<HashMap<_, _>>>()?;

        let mut report = SyncReport::default();

        for (addr, record) in &desired {
            match self.lookup(*addr) {
                Some(current) if current == *record => report.unchanged += 1,
                Some(_) => {
                    self.clients.insert(*addr, *record);
                    report.updated += 1;
                }
                None => {
                    self.clients.insert(*addr, *record);
                    report.added += 1;
                }
            }
        }

        let stale: Vec<Ipv4Addr> = self
            .clients
            .iter()
            .map(|r| *r.key())
            .filter(|addr| !desired.contains_key(addr))
            .collect();
        for addr in stale {
            if self.clients.remove(&addr).is_some() {
                report.removed += 1;
            }
        }

        if report.added + report.updated + report.removed > 0 {
            tracing::info!(
                added = report.added,
                updated = report.updated,
                removed = report.removed,
                total = self.clients.len(),
                "client registry synced"
            );
        }

        Ok(report)
    }

    /// Number of registered addresses
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
