//! Shaper Configuration

use crate::classify::LinkLayer;
use crate::pacing::{Horizons, PacingMode};
use serde::{Deserialize, Serialize};
use shaper_common::{Rate, ShaperError, ShaperResult};
use std::num::NonZeroU64;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 1 Mbit/s
const DEFAULT_RATE: Rate = match NonZeroU64::new(125_000) {
    Some(bytes) => Rate::from_bytes_per_sec(bytes),
    None => unreachable!(),
};

/// How packets of identified clients map to pacing keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    /// One key per source address at the default rate; registry unused
    Global,
    /// One key per (client, direction) at the client's rate
    PerClientDirection,
    /// One key per (account, direction) at the rate of the client seen
    #[default]
    PerAccountDirection,
}

/// Shaper configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ShaperConfig {
    /// Processing units; sizes per-core partitions
    pub num_cores: usize,
    /// Pacing key selection
    pub key_strategy: KeyStrategy,
    /// Ceiling for unidentified traffic and the global strategy, bit/s
    pub default_rate: Rate,
    /// Drop and mark thresholds
    pub horizons: Horizons,
    /// Read-decide-write consistency
    pub pacing_mode: PacingMode,
    /// Frame format handed to the classifier
    pub link_layer: LinkLayer,
    /// Maximum pacing keys
    pub pacing_capacity: usize,
    /// Maximum accounts per core
    pub account_capacity: usize,
    /// Count bytes per remote endpoint as well
    pub audit_destinations: bool,
    /// Maximum destinations per core
    pub audit_capacity: usize,
    /// Destinations below this many bytes each way per interval are not reported
    pub min_audit_bytes: u64,
    /// Collector tick (milliseconds)
    pub collect_interval_ms: u64,
    /// Period at which accumulated metrics are taken and reported (milliseconds)
    pub report_interval_ms: u64,
    /// Pacing keys idle this long are evicted (milliseconds, 0 disables)
    pub idle_timeout_ms: u64,
    /// JSON client list re-read on every tick
    pub clients_path: Option<PathBuf>,
    /// Serve the published counters for scraping here
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for ShaperConfig {
    fn default() -> Self {
        Self {
            num_cores: num_cpus(),
            key_strategy: KeyStrategy::default(),
            default_rate: DEFAULT_RATE,
            horizons: Horizons::default(),
            pacing_mode: PacingMode::default(),
            link_layer: LinkLayer::default(),
            pacing_capacity: 65536,
            account_capacity: 65536,
            audit_destinations: false,
            audit_capacity: 65536,
            min_audit_bytes: 4096,
            collect_interval_ms: 1000,
            report_interval_ms: 30_000,
            idle_timeout_ms: 10_000,
            clients_path: None,
            metrics_addr: None,
        }
    }
}

fn num_cpus() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

impl ShaperConfig {
    /// Load from a JSON file; missing fields take their defaults
    pub fn load(path: impl AsRef<Path>) -> ShaperResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to file
    pub fn save(&self, path: impl AsRef<Path>) -> ShaperResult<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject combinations the engine cannot run with
    pub fn validate(&self) -> ShaperResult<()> {
        if self.num_cores == 0 {
            return Err(ShaperError::Config("num_cores must be positive".into()));
        }
        if self.pacing_capacity == 0 || self.account_capacity == 0 {
            return Err(ShaperError::Config("capacities must be positive".into()));
        }
        if self.audit_destinations && self.audit_capacity == 0 {
            return Err(ShaperError::Config(
                "audit_capacity must be positive when auditing".into(),
            ));
        }
        if self.horizons.ecn_ns > self.horizons.drop_ns {
            return Err(ShaperError::Config(format!(
                "ecn horizon {}ns exceeds drop horizon {}ns",
                self.horizons.ecn_ns, self.horizons.drop_ns
            )));
        }
        if self.collect_interval_ms == 0 || self.report_interval_ms == 0 {
            return Err(ShaperError::Config("intervals must be positive".into()));
        }
        Ok(())
    }

    /// Collector tick
    pub fn collect_interval(&self) -> Duration {
        Duration::from_millis(self.collect_interval_ms)
    }

    /// Report period
    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }

    /// Idle eviction threshold in nanoseconds
    pub fn idle_timeout_ns(&self) -> u64 {
        self.idle_timeout_ms.saturating_mul(1_000_000)
    }

    /// Destination partition size, 0 when auditing is off
    pub fn effective_audit_capacity(&self) -> usize {
        if self.audit_destinations {
            self.audit_capacity
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ShaperConfig::default();
        assert_eq!(config.default_rate.bits_per_sec(), 1_000_000);
        assert_eq!(config.key_strategy, KeyStrategy::PerAccountDirection);
        assert_eq!(config.horizons.drop_ns, 2_000_000_000);
        assert_eq!(config.horizons.ecn_ns, 5_000_000);
        assert_eq!(config.min_audit_bytes, 4096);
        assert_eq!(config.effective_audit_capacity(), 0);
        assert!(config.metrics_addr.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_json() {
        let json = r#"{
            "num_cores": 2,
            "key_strategy": "per_client_direction",
            "default_rate": 8000000,
            "pacing_mode": "serialized",
            "link_layer": "ethernet",
            "horizons": { "ecn_ns": 1000000 },
            "metrics_addr": "127.0.0.1:9100"
        }"#;
        let config: ShaperConfig = serde_json::from_str(json).unwrap();

        assert_eq!(config.num_cores, 2);
        assert_eq!(config.key_strategy, KeyStrategy::PerClientDirection);
        assert_eq!(config.default_rate.bytes_per_sec(), 1_000_000);
        assert_eq!(config.pacing_mode, PacingMode::Serialized);
        assert_eq!(config.link_layer, LinkLayer::Ethernet);
        assert_eq!(config.horizons.ecn_ns, 1_000_000);
        assert_eq!(config.horizons.drop_ns, 2_000_000_000);
        assert_eq!(config.collect_interval(), Duration::from_secs(1));
        assert_eq!(config.report_interval(), Duration::from_secs(30));
        assert_eq!(config.metrics_addr, Some("127.0.0.1:9100".parse().unwrap()));
    }

    #[test]
    fn test_zero_default_rate_rejected() {
        assert!(serde_json::from_str::<ShaperConfig>(r#"{"default_rate": 0}"#).is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = ShaperConfig::default();
        config.horizons.ecn_ns = config.horizons.drop_ns + 1;
        assert!(matches!(config.validate(), Err(ShaperError::Config(_))));

        let config = ShaperConfig {
            num_cores: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = ShaperConfig {
            audit_destinations: true,
            audit_capacity: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load() {
        let path = std::env::temp_dir().join(format!("shaper-config-{}.json", std::process::id()));
        let config = ShaperConfig {
            num_cores: 3,
            audit_destinations: true,
            clients_path: Some("/etc/shaper/clients.json".into()),
            ..Default::default()
        };
        config.save(&path).unwrap();

        let loaded = ShaperConfig::load(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(loaded, config);
    }
}
