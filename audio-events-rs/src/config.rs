//! Bridge configuration.
//!
//! All fields have defaults, so an empty JSON object (or no configuration at
//! all) yields a working bridge.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::{Backpressure, BridgeError, ChannelConfig};

/// What a notification callback does when its channel is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Stall the OS thread up to `push_timeout_ms`, then drop the oldest event
    #[default]
    BlockWithTimeout,

    /// Never stall; drop the oldest event immediately
    DropOldest,
}

/// Configuration for an [`AudioBridge`](crate::AudioBridge).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Depth of every event channel
    pub channel_capacity: usize,

    /// How long a callback may wait for room in a full channel
    pub push_timeout_ms: u64,

    pub overflow_policy: OverflowPolicy,

    /// Optional tracing filter directive (e.g. "debug", "audio_events=trace")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 32,
            push_timeout_ms: 50,
            overflow_policy: OverflowPolicy::default(),
            log_level: None,
        }
    }
}

impl BridgeConfig {
    /// Reject settings the channels cannot work with.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if self.channel_capacity == 0 {
            return Err(BridgeError::InvalidConfig {
                reason: "channel_capacity must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    /// Channel settings derived from this configuration.
    pub fn channel(&self) -> ChannelConfig {
        let backpressure = match self.overflow_policy {
            OverflowPolicy::BlockWithTimeout => {
                Backpressure::BlockWithTimeout(Duration::from_millis(self.push_timeout_ms))
            }
            OverflowPolicy::DropOldest => Backpressure::DropOldest,
        };
        ChannelConfig {
            capacity: self.channel_capacity,
            backpressure,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.channel_capacity, 32);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.channel().backpressure,
            Backpressure::BlockWithTimeout(Duration::from_millis(50))
        );
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: BridgeConfig =
            serde_json::from_str(r#"{"overflow_policy": "drop_oldest"}"#).unwrap();
        assert_eq!(config.overflow_policy, OverflowPolicy::DropOldest);
        assert_eq!(config.push_timeout_ms, 50);
        assert_eq!(config.channel().backpressure, Backpressure::DropOldest);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = BridgeConfig {
            channel_capacity: 0,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(BridgeError::InvalidConfig { .. })
        ));
    }
}
