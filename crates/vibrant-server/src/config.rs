//! Server configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::BrokerConfig;

/// Evaluate command sent to every agent shortly after it connects.
pub const DEFAULT_WELCOME_SCRIPT: &str = "console.log('[AgentWelcome] broker says hello! Location: ' + window.location.href + '. Title: ' + document.title + '. Timestamp: ' + new Date().toLocaleTimeString()); ({ pageTitle: document.title, userAgent: navigator.userAgent, connectionTime: new Date().toISOString() });";

/// Configuration for the broker server.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `9999`, `0` to auto-assign).
    pub port: u16,
    /// Outbound queue capacity per agent connection.
    pub max_send_queue: usize,
    /// Interval between server-initiated Ping frames.
    pub heartbeat_interval_secs: u64,
    /// Close a connection after this long without any inbound frame.
    pub idle_timeout_secs: u64,
    /// Await timeout when the caller passes no `timeoutMs`.
    pub default_await_timeout_ms: u64,
    /// Upper bound for a caller-provided `timeoutMs`.
    pub max_await_timeout_ms: u64,
    /// How long an unanswered request stays in the pending table. A caller
    /// waiting longer keeps its request alive until its own timeout.
    pub request_ttl_secs: u64,
    /// Reaper tick.
    pub reaper_interval_secs: u64,
    /// Max WebSocket message size in bytes.
    pub max_message_size: usize,
    /// Drop fan-outs with no connections on each reaper tick.
    pub prune_empty_fanouts: bool,
    /// Script evaluated on every new connection. `None` disables it.
    pub welcome_script: Option<String>,
    /// Delay before the welcome script is sent.
    pub welcome_delay_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 9999,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 90,
            default_await_timeout_ms: 30_000,
            max_await_timeout_ms: 300_000,
            request_ttl_secs: 60,
            reaper_interval_secs: 5,
            max_message_size: 16 * 1024 * 1024, // 16 MB
            prune_empty_fanouts: false,
            welcome_script: None,
            welcome_delay_ms: 1000,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn welcome_delay(&self) -> Duration {
        Duration::from_millis(self.welcome_delay_ms)
    }

    /// Resolve a caller's `timeoutMs`, capped at the configured maximum.
    pub fn await_timeout(&self, requested_ms: Option<u64>) -> Duration {
        let ms = requested_ms
            .unwrap_or(self.default_await_timeout_ms)
            .min(self.max_await_timeout_ms);
        Duration::from_millis(ms)
    }

    pub fn broker_config(&self) -> BrokerConfig {
        BrokerConfig {
            default_timeout: Duration::from_millis(self.default_await_timeout_ms),
            request_ttl: Duration::from_secs(self.request_ttl_secs),
            prune_empty_fanouts: self.prune_empty_fanouts,
        }
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("max_send_queue", self.max_send_queue as u64),
            ("heartbeat_interval_secs", self.heartbeat_interval_secs),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("reaper_interval_secs", self.reaper_interval_secs),
            ("max_message_size", self.max_message_size as u64),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        if self.default_await_timeout_ms > self.max_await_timeout_ms {
            return Err(ConfigError::InvalidValue {
                field: "default_await_timeout_ms",
                reason: format!("exceeds max_await_timeout_ms ({})", self.max_await_timeout_ms),
            });
        }
        if self.heartbeat_interval_secs >= self.idle_timeout_secs {
            return Err(ConfigError::InvalidValue {
                field: "heartbeat_interval_secs",
                reason: "must be shorter than idle_timeout_secs".into(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid config JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

impl ConfigError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::InvalidValue { .. } => "invalid_value",
        }
    }
}

/// Load a config file. Missing fields take their defaults.
pub fn load_config(path: &Path) -> Result<ServerConfig, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    let config: ServerConfig = serde_json::from_str(&raw)?;
    config.validate()?;
    Ok(config)
}
