use crate::bus::MAX_RETRY_TRANSPORT_ACTIVE;
use crate::control::{Capabilities, ChipId, RawTpDirection, SlaveConfig};
use crate::flow::{DEFAULT_THROTTLE_HIGH_THRESHOLD, DEFAULT_THROTTLE_LOW_THRESHOLD};
use crate::queue::{DEFAULT_PRIORITY_QUEUES, DEFAULT_QUEUE_DEPTH, MAX_PRIORITY_QUEUES, MAX_QUEUE_DEPTH};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

const DEFAULT_MAX_DRAIN_PER_PRIORITY: usize = 8;
const DEFAULT_PUMP_WAIT_TIMEOUT_MS: u64 = 100;
const DEFAULT_BUS_READY_INTERVAL_MS: u64 = 10;
const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 2000;
const DEFAULT_POWER_SAVE_ACK_TIMEOUT_MS: u64 = 1000;
const DEFAULT_THROTTLE_BACKOFF_MS: u64 = 5;
const DEFAULT_MAX_THROTTLE_RETRIES: u32 = 200;
const DEFAULT_RECEIVE_TIMEOUT_MS: u64 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("priority_queues must be between 1 and {max}, got {value}")]
    PriorityQueues { value: usize, max: usize },
    #[error("queue_depth must be between 1 and {max}, got {value}")]
    QueueDepth { value: usize, max: usize },
    #[error("{0} must be non-zero")]
    Zero(&'static str),
    #[error("throttle thresholds must satisfy low < high <= 100, got low {low} high {high}")]
    Thresholds { high: u8, low: u8 },
    #[error("invalid configuration file: {0}")]
    Parse(String),
}

/// Link-layer configuration. All timing is in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub priority_queues: usize,
    pub queue_depth: usize,
    /// Upper bound on items taken from one priority per pump wake.
    pub max_drain_per_priority: usize,
    /// `None` lets pumps block on their wake signal until shutdown.
    pub pump_wait_timeout_ms: Option<u64>,
    pub bus_ready_max_retries: u32,
    pub bus_ready_interval_ms: u64,
    pub handshake_timeout_ms: u64,
    pub power_save_ack_timeout_ms: u64,
    pub throttle_backoff_ms: u64,
    pub max_throttle_retries: u32,
    pub throttle_high_threshold: u8,
    pub throttle_low_threshold: u8,
    pub host_capabilities: Capabilities,
    pub expected_chip: ChipId,
    pub raw_tp_request: RawTpDirection,
    pub checksum_enabled: bool,
    pub receive_timeout_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            priority_queues: DEFAULT_PRIORITY_QUEUES,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            max_drain_per_priority: DEFAULT_MAX_DRAIN_PER_PRIORITY,
            pump_wait_timeout_ms: Some(DEFAULT_PUMP_WAIT_TIMEOUT_MS),
            bus_ready_max_retries: MAX_RETRY_TRANSPORT_ACTIVE,
            bus_ready_interval_ms: DEFAULT_BUS_READY_INTERVAL_MS,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            power_save_ack_timeout_ms: DEFAULT_POWER_SAVE_ACK_TIMEOUT_MS,
            throttle_backoff_ms: DEFAULT_THROTTLE_BACKOFF_MS,
            max_throttle_retries: DEFAULT_MAX_THROTTLE_RETRIES,
            throttle_high_threshold: DEFAULT_THROTTLE_HIGH_THRESHOLD,
            throttle_low_threshold: DEFAULT_THROTTLE_LOW_THRESHOLD,
            host_capabilities: Capabilities {
                checksum: true,
                ..Capabilities::default()
            },
            expected_chip: ChipId::Unrecognized,
            raw_tp_request: RawTpDirection::None,
            checksum_enabled: true,
            receive_timeout_ms: DEFAULT_RECEIVE_TIMEOUT_MS,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.priority_queues == 0 || self.priority_queues > MAX_PRIORITY_QUEUES {
            return Err(ConfigError::PriorityQueues {
                value: self.priority_queues,
                max: MAX_PRIORITY_QUEUES,
            });
        }
        if self.queue_depth == 0 || self.queue_depth > MAX_QUEUE_DEPTH {
            return Err(ConfigError::QueueDepth {
                value: self.queue_depth,
                max: MAX_QUEUE_DEPTH,
            });
        }

        let non_zero = [
            ("max_drain_per_priority", self.max_drain_per_priority as u64),
            ("bus_ready_max_retries", self.bus_ready_max_retries as u64),
            ("handshake_timeout_ms", self.handshake_timeout_ms),
            ("power_save_ack_timeout_ms", self.power_save_ack_timeout_ms),
            ("receive_timeout_ms", self.receive_timeout_ms),
            ("throttle_backoff_ms", self.throttle_backoff_ms),
            ("pump_wait_timeout_ms", self.pump_wait_timeout_ms.unwrap_or(1)),
        ];
        if let Some((name, _)) = non_zero.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Zero(*name));
        }

        if self.throttle_low_threshold >= self.throttle_high_threshold || self.throttle_high_threshold > 100 {
            return Err(ConfigError::Thresholds {
                high: self.throttle_high_threshold,
                low: self.throttle_low_threshold,
            });
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: TransportConfig =
            serde_json::from_str(json).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// The SLAVE_CONFIG announcement derived from this configuration.
    pub fn slave_config(&self) -> SlaveConfig {
        SlaveConfig {
            host_capabilities: Capabilities {
                checksum: self.checksum_enabled,
                ..self.host_capabilities
            },
            expected_chip: self.expected_chip,
            raw_tp_request: self.raw_tp_request,
            throttle_high_threshold: self.throttle_high_threshold,
            throttle_low_threshold: self.throttle_low_threshold,
        }
    }

    pub fn pump_wait_timeout(&self) -> Option<Duration> {
        self.pump_wait_timeout_ms.map(Duration::from_millis)
    }

    pub fn bus_ready_interval(&self) -> Duration {
        Duration::from_millis(self.bus_ready_interval_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn power_save_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.power_save_ack_timeout_ms)
    }

    pub fn throttle_backoff(&self) -> Duration {
        Duration::from_millis(self.throttle_backoff_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = TransportConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.priority_queues, 3);
        assert_eq!(config.queue_depth, 20);
        assert_eq!(config.throttle_high_threshold, 80);
        assert_eq!(config.throttle_low_threshold, 60);
        assert_eq!(config.pump_wait_timeout(), Some(Duration::from_millis(100)));
        assert_eq!(config.bus_ready_max_retries, MAX_RETRY_TRANSPORT_ACTIVE);
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = TransportConfig::default();
        config.priority_queues = 0;
        assert!(matches!(config.validate(), Err(ConfigError::PriorityQueues { .. })));

        let mut config = TransportConfig::default();
        config.queue_depth = MAX_QUEUE_DEPTH + 1;
        assert!(matches!(config.validate(), Err(ConfigError::QueueDepth { .. })));

        let mut config = TransportConfig::default();
        config.handshake_timeout_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::Zero("handshake_timeout_ms")));

        let mut config = TransportConfig::default();
        config.throttle_backoff_ms = 0;
        assert_eq!(config.validate(), Err(ConfigError::Zero("throttle_backoff_ms")));

        let mut config = TransportConfig::default();
        config.throttle_low_threshold = 90;
        assert!(matches!(config.validate(), Err(ConfigError::Thresholds { .. })));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = TransportConfig::from_json(r#"{"queue_depth": 8, "expected_chip": "Esp32C3"}"#).unwrap();
        assert_eq!(config.queue_depth, 8);
        assert_eq!(config.expected_chip, ChipId::Esp32C3);
        assert_eq!(config.priority_queues, 3);

        assert!(matches!(
            TransportConfig::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_slave_config_mirrors_settings() {
        let config = TransportConfig {
            checksum_enabled: false,
            raw_tp_request: RawTpDirection::HostToSlave,
            ..TransportConfig::default()
        };
        let announcement = config.slave_config();
        assert!(!announcement.host_capabilities.checksum);
        assert_eq!(announcement.raw_tp_request, RawTpDirection::HostToSlave);
        assert_eq!(announcement.throttle_high_threshold, 80);
    }
}
