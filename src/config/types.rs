//! Configuration Types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address. `":3000"` is shorthand for `0.0.0.0:3000`.
    pub bind_addr: String,
    pub mode: ServerMode,
    /// Upper bound on the bytes taken by a single read.
    pub buffer_size: usize,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub accept_backoff: Duration,
    /// Consecutive non-transient accept failures tolerated before the accept loop gives up.
    pub max_accept_errors: u32,
}

/// What a read task does with the bytes it receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ServerMode {
    /// Hand every read to the message consumer and acknowledge it to the peer.
    Route,
    /// Log every read as text, reply with nothing.
    LogOnly,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:3000".to_string(),
            mode: ServerMode::Route,
            buffer_size: 2048,
            shutdown_timeout: Duration::from_secs(5),
            accept_backoff: Duration::from_millis(100),
            max_accept_errors: 64,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl fmt::Display for ServerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerMode::Route => f.write_str("route"),
            ServerMode::LogOnly => f.write_str("log-only"),
        }
    }
}

impl FromStr for ServerMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "route" | "routing" => Ok(ServerMode::Route),
            "log-only" | "log_only" | "log" => Ok(ServerMode::LogOnly),
            other => Err(format!(
                "unknown server mode '{}' (expected 'route' or 'log-only')",
                other
            )),
        }
    }
}
