//! Transport configuration.
//!
//! All fields have defaults, so an empty TOML table yields a usable
//! configuration:
//!
//! ```toml
//! bind_host = "0.0.0.0"
//! port = 3883
//! poll_timeout_ms = 10
//! ping_timeout_ms = 5000
//!
//! [log]
//! path = "session.tlog"
//! mode = "both"
//! ```

use crate::error::{TransportError, TransportResult};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Port a server listens on when none is given.
pub const DEFAULT_PORT: u16 = 3883;

/// Which direction of traffic a logger records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogMode {
    Incoming,
    Outgoing,
    #[default]
    Both,
}

impl LogMode {
    pub fn logs_incoming(self) -> bool {
        matches!(self, LogMode::Incoming | LogMode::Both)
    }

    pub fn logs_outgoing(self) -> bool {
        matches!(self, LogMode::Outgoing | LogMode::Both)
    }

    /// Bit flags used in log-description payloads.
    pub fn to_bits(self) -> u32 {
        match self {
            LogMode::Incoming => 1,
            LogMode::Outgoing => 2,
            LogMode::Both => 3,
        }
    }

    pub fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            1 => Some(LogMode::Incoming),
            2 => Some(LogMode::Outgoing),
            3 => Some(LogMode::Both),
            _ => None,
        }
    }
}

/// Persistent message logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log file to create. An existing file is never overwritten.
    pub path: PathBuf,
    #[serde(default)]
    pub mode: LogMode,
    /// Number of buffered entries that triggers a write to disk.
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,
}

fn default_flush_threshold() -> usize {
    64
}

impl LogConfig {
    pub fn new(path: impl Into<PathBuf>, mode: LogMode) -> Self {
        Self {
            path: path.into(),
            mode,
            flush_threshold: default_flush_threshold(),
        }
    }
}

/// Configuration for one connection (server, client or replay).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Address the server binds (and clients bind their datagram socket on).
    pub bind_host: String,
    /// Server listen port. `0` picks an ephemeral port.
    pub port: u16,
    /// Upper bound on the wait inside a single pump.
    pub poll_timeout_ms: u64,
    /// Time allowed to establish the reliable channel.
    pub connect_timeout_ms: u64,
    /// A ping without a pong after this long drops the peer.
    pub ping_timeout_ms: u64,
    /// Send a ping this often after the handshake. `None` pings only once.
    pub ping_interval_ms: Option<u64>,
    /// Client reconnect period after a lost link. `None` disables reconnects.
    pub reconnect_interval_ms: Option<u64>,
    /// Queued low-latency datagrams per peer before the oldest is dropped.
    pub low_latency_backlog: usize,
    /// Start logging as soon as the connection is created.
    pub log: Option<LogConfig>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            poll_timeout_ms: 10,
            connect_timeout_ms: 2_000,
            ping_timeout_ms: 5_000,
            ping_interval_ms: None,
            reconnect_interval_ms: None,
            low_latency_backlog: 256,
            log: None,
        }
    }
}

impl TransportConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> TransportResult<Self> {
        let config: Self =
            toml::from_str(text).map_err(|e| TransportError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> TransportResult<()> {
        if self.ping_timeout_ms == 0 {
            return Err(TransportError::Config(
                "ping_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.low_latency_backlog == 0 {
            return Err(TransportError::Config(
                "low_latency_backlog must be greater than zero".into(),
            ));
        }
        if let Some(log) = &self.log {
            if log.flush_threshold == 0 {
                return Err(TransportError::Config(
                    "log.flush_threshold must be greater than zero".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }

    pub fn ping_interval(&self) -> Option<Duration> {
        self.ping_interval_ms.map(Duration::from_millis)
    }

    pub fn reconnect_interval(&self) -> Option<Duration> {
        self.reconnect_interval_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config = TransportConfig::from_toml_str("").unwrap();
        assert_eq!(config, TransportConfig::default());
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.poll_timeout(), Duration::from_millis(10));
        assert!(config.log.is_none());
    }

    #[test]
    fn test_parse_overrides_and_log_table() {
        let config = TransportConfig::from_toml_str(
            r#"
            bind_host = "127.0.0.1"
            port = 0
            ping_interval_ms = 1000
            reconnect_interval_ms = 250

            [log]
            path = "/tmp/session.tlog"
            mode = "incoming"
            "#,
        )
        .unwrap();
        assert_eq!(config.bind_host, "127.0.0.1");
        assert_eq!(config.port, 0);
        assert_eq!(config.ping_interval(), Some(Duration::from_secs(1)));
        assert_eq!(config.reconnect_interval(), Some(Duration::from_millis(250)));
        let log = config.log.unwrap();
        assert_eq!(log.mode, LogMode::Incoming);
        assert_eq!(log.flush_threshold, 64);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let err = TransportConfig::from_toml_str("ping_timeout_ms = 0").unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
        let err = TransportConfig::from_toml_str("port = \"abc\"").unwrap_err();
        assert!(matches!(err, TransportError::Config(_)));
    }

    #[test]
    fn test_log_mode_bits() {
        for mode in [LogMode::Incoming, LogMode::Outgoing, LogMode::Both] {
            assert_eq!(LogMode::from_bits(mode.to_bits()), Some(mode));
        }
        assert_eq!(LogMode::from_bits(0), None);
        assert!(LogMode::Both.logs_incoming() && LogMode::Both.logs_outgoing());
        assert!(!LogMode::Incoming.logs_outgoing());
    }
}
