//! Configuration types for WS-Discovery and the reachability routing table

use crate::retry::BackoffConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Well-known WS-Discovery port (IANA registered)
pub const DEFAULT_DISCOVERY_PORT: u16 = 3702;

/// Configuration for the WS-Discovery client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// Network interface to listen on (e.g. "p2p-wlan0-0"); None lets the host decide
    #[serde(default)]
    pub interface: Option<String>,

    /// UDP port used for discovery traffic
    #[serde(default = "default_port")]
    pub port: u16,

    /// Interval between probes (milliseconds). None disables periodic probing.
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: Option<u64>,

    /// Type filter sent with every probe (e.g. "dn:NetworkVideoTransmitter")
    #[serde(default = "default_probe_types")]
    pub probe_types: Vec<String>,

    /// Multicast TTL / hop limit for outgoing probes
    #[serde(default = "default_multicast_ttl")]
    pub multicast_ttl: u32,

    /// Idle receive timeout (milliseconds); the receive loop polls at this cadence
    #[serde(default = "default_receive_timeout")]
    pub receive_timeout_ms: u64,

    /// Backoff used while waiting for the interface to appear
    #[serde(default)]
    pub interface_retry: BackoffConfig,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interface: None,
            port: default_port(),
            probe_interval_ms: default_probe_interval(),
            probe_types: default_probe_types(),
            multicast_ttl: default_multicast_ttl(),
            receive_timeout_ms: default_receive_timeout(),
            interface_retry: BackoffConfig::default(),
        }
    }
}

impl DiscoveryConfig {
    /// Returns the probe interval as a Duration, if periodic probing is enabled
    pub fn probe_interval(&self) -> Option<Duration> {
        self.probe_interval_ms.map(Duration::from_millis)
    }

    /// Returns the idle receive timeout as a Duration
    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.probe_interval_ms == Some(0) {
            return Err("probe_interval_ms cannot be 0 (omit it to disable probing)".to_string());
        }

        if self.receive_timeout_ms == 0 {
            return Err("receive_timeout_ms cannot be 0".to_string());
        }

        if self.multicast_ttl == 0 || self.multicast_ttl > 255 {
            return Err("multicast_ttl must be between 1 and 255".to_string());
        }

        if self.probe_types.iter().any(|t| t.trim().is_empty() || t.contains(char::is_whitespace)) {
            return Err("probe_types entries must be single non-empty tokens".to_string());
        }

        self.interface_retry
            .validate()
            .map_err(|e| format!("interface_retry: {}", e))
    }
}

/// Configuration for the reachability routing table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingConfig {
    /// Silence after which an endpoint is excluded from the reachable set (milliseconds)
    #[serde(default = "default_delinquency_interval")]
    pub delinquency_interval_ms: u64,

    /// Upper bound on the recompute timer period (milliseconds)
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,

    /// Path the XAddr is rewritten onto to form the playback URL
    #[serde(default = "default_playback_path")]
    pub playback_path: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            delinquency_interval_ms: default_delinquency_interval(),
            sweep_interval_ms: default_sweep_interval(),
            playback_path: default_playback_path(),
        }
    }
}

impl RoutingConfig {
    /// Returns the delinquency interval as a Duration
    pub fn delinquency_interval(&self) -> Duration {
        Duration::from_millis(self.delinquency_interval_ms)
    }

    /// Recompute timer period: never coarser than the delinquency interval
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms.min(self.delinquency_interval_ms))
    }

    /// Validates the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.delinquency_interval_ms == 0 {
            return Err("delinquency_interval_ms cannot be 0".to_string());
        }

        if self.sweep_interval_ms == 0 {
            return Err("sweep_interval_ms cannot be 0".to_string());
        }

        if !self.playback_path.starts_with('/') {
            return Err("playback_path must start with '/'".to_string());
        }

        Ok(())
    }
}

// Default configuration values
fn default_port() -> u16 {
    DEFAULT_DISCOVERY_PORT
}

fn default_probe_interval() -> Option<u64> {
    Some(1000) // Probing is cheap on a local link
}

fn default_probe_types() -> Vec<String> {
    vec!["dn:NetworkVideoTransmitter".to_string()]
}

fn default_multicast_ttl() -> u32 {
    4
}

fn default_receive_timeout() -> u64 {
    5000
}

fn default_delinquency_interval() -> u64 {
    3000 // Three missed probes
}

fn default_sweep_interval() -> u64 {
    1000
}

fn default_playback_path() -> String {
    "/video".to_string()
}
