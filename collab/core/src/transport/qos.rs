//! QoS Profiles
//!
//! Each channel data type maps to one of two fixed QoS profiles handed
//! to the transport when listening or binding: a low profile for the
//! control plane (message, bytes, file) and a high one for video
//! streams. The concrete values come from [`crate::config::QosConfig`].

use crate::channel::ChannelDataType;
use crate::config::{QosConfig, QosProfileConfig};

/// A single QoS parameter passed to the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QosTv {
    /// Which parameter this value configures.
    pub qos: QosType,
    /// The parameter value.
    pub value: i32,
}

/// QoS parameter kinds understood by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QosType {
    /// Minimum bandwidth in bytes per second.
    MinBandwidth,
    /// Maximum tolerated latency in milliseconds.
    MaxLatency,
    /// Minimum expected latency in milliseconds.
    MinLatency,
    /// Keep the link continuously transmitting.
    TransContinuous,
    /// Idle timeout in milliseconds.
    MaxIdleTimeout,
}

/// The two materialized QoS parameter lists.
#[derive(Debug, Clone)]
pub struct QosProfiles {
    low: Vec<QosTv>,
    high: Vec<QosTv>,
}

fn materialize(profile: &QosProfileConfig) -> Vec<QosTv> {
    let mut params = vec![
        QosTv {
            qos: QosType::MinBandwidth,
            value: profile.min_bandwidth,
        },
        QosTv {
            qos: QosType::MaxLatency,
            value: profile.max_latency_ms,
        },
        QosTv {
            qos: QosType::MinLatency,
            value: profile.min_latency_ms,
        },
    ];
    if profile.continuous {
        params.push(QosTv {
            qos: QosType::TransContinuous,
            value: 1,
        });
    }
    params.push(QosTv {
        qos: QosType::MaxIdleTimeout,
        value: profile.max_idle_timeout_ms,
    });
    params
}

impl QosProfiles {
    /// Build both profiles from configuration.
    #[must_use]
    pub fn from_config(config: &QosConfig) -> Self {
        Self {
            low: materialize(&config.low),
            high: materialize(&config.high),
        }
    }

    /// The low (control-plane) profile.
    #[must_use]
    pub fn low(&self) -> &[QosTv] {
        &self.low
    }

    /// The profile for a channel data type.
    #[must_use]
    pub fn for_data_type(&self, data_type: ChannelDataType) -> &[QosTv] {
        match data_type {
            ChannelDataType::VideoStream => &self.high,
            ChannelDataType::Message | ChannelDataType::Bytes | ChannelDataType::File => &self.low,
        }
    }
}
