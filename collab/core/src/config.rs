//! Configuration
//!
//! Tunables for the transport core: QoS profile values, connect and RPC
//! timeouts, and send-size limits. Everything has sensible defaults; a
//! deployment can override them from a TOML document.
//!
//! QoS values are configuration, not protocol: two peers do not need to
//! agree on them.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::errors::{CollabError, Result};

/// Values for one QoS profile handed to the transport on listen/bind.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct QosProfileConfig {
    /// Minimum bandwidth in bytes per second.
    pub min_bandwidth: i32,
    /// Maximum tolerated latency in milliseconds.
    pub max_latency_ms: i32,
    /// Minimum expected latency in milliseconds.
    pub min_latency_ms: i32,
    /// Idle timeout before the transport may reclaim the link.
    pub max_idle_timeout_ms: i32,
    /// Whether the link should be kept continuously transmitting.
    pub continuous: bool,
}

/// The two QoS profiles selected by channel data type.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct QosConfig {
    /// Control-plane profile: message, bytes, and file channels.
    pub low: QosProfileConfig,
    /// Data-plane profile: video stream channels.
    pub high: QosProfileConfig,
}

impl Default for QosConfig {
    fn default() -> Self {
        Self {
            low: QosProfileConfig {
                min_bandwidth: 64 * 1024,
                max_latency_ms: 10_000,
                min_latency_ms: 2_000,
                max_idle_timeout_ms: 60 * 60 * 1000,
                continuous: true,
            },
            high: QosProfileConfig {
                min_bandwidth: 4 * 1024 * 1024,
                max_latency_ms: 10_000,
                min_latency_ms: 2_000,
                max_idle_timeout_ms: 60 * 60 * 1000,
                continuous: false,
            },
        }
    }
}

/// Top-level configuration for the collaboration transport core.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CollabConfig {
    /// QoS profiles.
    pub qos: QosConfig,
    /// How long a session may stay in `Connecting` before it is released.
    pub connect_timeout_ms: u64,
    /// Per-call timeout for remote scheduler RPCs.
    pub scheduler_rpc_timeout_ms: u64,
    /// Largest payload accepted by a message-channel send.
    pub max_message_size: usize,
}

impl Default for CollabConfig {
    fn default() -> Self {
        Self {
            qos: QosConfig::default(),
            connect_timeout_ms: 10_000,
            scheduler_rpc_timeout_ms: 5_000,
            max_message_size: 4 * 1024,
        }
    }
}

impl CollabConfig {
    /// Parse a configuration from a TOML document.
    ///
    /// Missing keys fall back to defaults.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        toml::from_str(s).map_err(|e| CollabError::InvalidParameters(format!("bad config: {e}")))
    }

    /// Load a configuration file from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            CollabError::InvalidParameters(format!("cannot read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CollabConfig::default();
        assert_eq!(config.max_message_size, 4096);
        assert_eq!(config.qos.low.min_bandwidth, 64 * 1024);
        assert_eq!(config.qos.high.min_bandwidth, 4 * 1024 * 1024);
    }

    #[test]
    fn test_partial_toml_overrides() {
        let config = CollabConfig::from_toml_str(
            r#"
            connect_timeout_ms = 3000

            [qos.high]
            min_bandwidth = 1048576
            max_latency_ms = 5000
            min_latency_ms = 1000
            max_idle_timeout_ms = 60000
            continuous = true
            "#,
        )
        .unwrap();
        assert_eq!(config.connect_timeout_ms, 3000);
        assert_eq!(config.qos.high.min_bandwidth, 1_048_576);
        // Untouched sections keep their defaults.
        assert_eq!(config.qos.low, QosConfig::default().low);
        assert_eq!(config.max_message_size, 4096);
    }

    #[test]
    fn test_bad_toml_is_rejected() {
        assert!(CollabConfig::from_toml_str("qos = 3").is_err());
    }
}
