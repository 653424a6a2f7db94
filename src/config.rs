//! Configuration module for mqttd
//!
//! Strongly-typed settings for the broker and the protocol timers. The
//! hosting binary fills [`BrokerConfig`] from environment variables; library
//! users construct it directly.

use std::env;
use std::time::Duration;

use crate::protocol::QoS;

/// Default MQTT port
pub const DEFAULT_PORT: u16 = 1883;

/// Largest frame accepted unless configured otherwise
pub const DEFAULT_MAX_PACKET_SIZE: usize = 256 * 1024;

/// Default per-session outbound queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// Default number of unacknowledged QoS1/QoS2 deliveries per subscriber
pub const DEFAULT_MAX_INFLIGHT: usize = 32;

/// Protocol timers and retry limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timings {
    /// How long to wait for CONNECT (server) or CONNACK (client)
    pub connect_timeout: Duration,
    /// Delay before an unacknowledged QoS1/QoS2 step is resent
    pub retry_interval: Duration,
    /// Resends per exchange step before the delivery is abandoned
    pub max_retries: u32,
    /// Transient transport failures tolerated before the connection is lost
    pub io_retries: u32,
    /// Pause between transport retries
    pub io_retry_backoff: Duration,
    /// Callbacks running longer than this are reported
    pub callback_budget: Duration,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            retry_interval: Duration::from_secs(5),
            max_retries: 3,
            io_retries: 3,
            io_retry_backoff: Duration::from_millis(100),
            callback_budget: Duration::from_millis(50),
        }
    }
}

impl Timings {
    /// Idle time tolerated past the keep-alive before a session is expired
    pub fn keep_alive_grace(keep_alive: Duration) -> Duration {
        keep_alive * 3 / 2
    }
}

/// Broker configuration
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Listen address
    pub host: String,
    /// Listen TCP port
    pub port: u16,
    /// Highest QoS granted to subscriptions
    pub max_qos: QoS,
    /// Outbound messages buffered per session before the oldest is dropped
    pub queue_capacity: usize,
    /// Unacknowledged deliveries per subscriber before queued messages wait
    pub max_inflight: usize,
    /// Frames larger than this close the connection
    pub max_packet_size: usize,
    /// Protocol timers
    pub timings: Timings,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            max_qos: QoS::ExactlyOnce,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_inflight: DEFAULT_MAX_INFLIGHT,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            timings: Timings::default(),
        }
    }
}

/// Configuration error type
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(&'static str, String),
}

impl BrokerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_qos = match env::var("MQTTD_MAX_QOS") {
            Ok(v) if !v.is_empty() => v
                .parse::<u8>()
                .ok()
                .and_then(|n| QoS::try_from(n).ok())
                .ok_or(ConfigError::InvalidValue("MQTTD_MAX_QOS", v))?,
            _ => defaults.max_qos,
        };

        let queue_capacity = parse_usize("MQTTD_QUEUE_CAPACITY", defaults.queue_capacity)?;
        if queue_capacity == 0 {
            return Err(ConfigError::InvalidValue(
                "MQTTD_QUEUE_CAPACITY",
                "0".to_string(),
            ));
        }

        let timings = Timings {
            connect_timeout: Duration::from_secs(parse_u64(
                "MQTTD_CONNECT_TIMEOUT",
                defaults.timings.connect_timeout.as_secs(),
            )?),
            retry_interval: Duration::from_secs(parse_u64(
                "MQTTD_RETRY_INTERVAL",
                defaults.timings.retry_interval.as_secs(),
            )?),
            max_retries: parse_u64("MQTTD_MAX_RETRIES", defaults.timings.max_retries as u64)?
                as u32,
            ..defaults.timings
        };

        Ok(BrokerConfig {
            host: env::var("MQTTD_HOST")
                .ok()
                .filter(|s| !s.is_empty())
                .unwrap_or(defaults.host),
            port: parse_u16("MQTTD_PORT", defaults.port)?,
            max_qos,
            queue_capacity,
            max_inflight: parse_usize("MQTTD_MAX_INFLIGHT", defaults.max_inflight)?.max(1),
            max_packet_size: parse_usize("MQTTD_MAX_PACKET_SIZE", defaults.max_packet_size)?,
            timings,
        })
    }

    /// Socket address string for the listener
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Read a boolean flag from the environment
pub fn parse_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
        .unwrap_or(default)
}

fn parse_u16(name: &'static str, default: u16) -> Result<u16, ConfigError> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name, v)),
        _ => Ok(default),
    }
}

fn parse_u64(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name, v)),
        _ => Ok(default),
    }
}

fn parse_usize(name: &'static str, default: usize) -> Result<usize, ConfigError> {
    match env::var(name) {
        Ok(v) if !v.is_empty() => v
            .parse()
            .map_err(|_| ConfigError::InvalidValue(name, v)),
        _ => Ok(default),
    }
}
