//! Configuration Manager

use super::{Config, ServerMode};
use crate::Result;
use anyhow::{bail, Context};
use std::path::Path;

/// Manages configuration loading and validation
pub struct ConfigManager;

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            let config = Config::default();
            config.validate()?;
            Ok(config)
        }
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Config> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    /// Build a configuration from defaults plus whatever `lookup` yields for
    /// the `CONNSERVER_*` keys.
    pub fn load_with<F>(lookup: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(bind_addr) = lookup("CONNSERVER_BIND_ADDR") {
            config.server.bind_addr = bind_addr;
        }

        if let Some(mode) = lookup("CONNSERVER_MODE") {
            config.server.mode = mode
                .parse::<ServerMode>()
                .map_err(anyhow::Error::msg)
                .with_context(|| format!("Invalid CONNSERVER_MODE: {}", mode))?;
        }

        if let Some(buffer_size) = lookup("CONNSERVER_BUFFER_SIZE") {
            config.server.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid CONNSERVER_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Some(timeout) = lookup("CONNSERVER_SHUTDOWN_TIMEOUT") {
            config.server.shutdown_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid CONNSERVER_SHUTDOWN_TIMEOUT: {}", timeout))?;
        }

        if let Some(log_level) = lookup("CONNSERVER_LOG_LEVEL") {
            config.logging.level = log_level;
        }

        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_logging_config()
            .with_context(|| "Logging configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        // Malformed addresses are reported by the bind itself.
        if self.server.bind_addr.trim().is_empty() {
            bail!("bind_addr must not be empty");
        }

        if self.server.buffer_size == 0 {
            bail!("buffer_size must be greater than 0");
        }

        if self.server.buffer_size > 1048576 {
            bail!("buffer_size cannot exceed 1MB");
        }

        if self.server.shutdown_timeout.is_zero() {
            bail!("shutdown_timeout must be greater than 0");
        }

        if self.server.max_accept_errors == 0 {
            bail!("max_accept_errors must be greater than 0");
        }

        Ok(())
    }

    fn validate_logging_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            bail!("logging.level must be one of: {}", valid_log_levels.join(", "));
        }

        Ok(())
    }

    /// Merge with CLI arguments
    pub fn merge_with_cli_args(
        &mut self,
        bind: Option<&str>,
        port: Option<u16>,
        mode: Option<ServerMode>,
        buffer_size: Option<usize>,
        log_level: Option<&str>,
    ) {
        if let Some(bind_str) = bind {
            self.server.bind_addr = bind_str.to_string();
            tracing::info!("CLI override: bind address set to {}", bind_str);
        }

        if let Some(port) = port {
            self.server.bind_addr = replace_port(&self.server.bind_addr, port);
            tracing::info!("CLI override: port set to {}", port);
        }

        if let Some(mode) = mode {
            self.server.mode = mode;
            tracing::info!("CLI override: mode set to {}", mode);
        }

        if let Some(buffer_size) = buffer_size {
            self.server.buffer_size = buffer_size;
            tracing::info!("CLI override: buffer size set to {} bytes", buffer_size);
        }

        if let Some(level) = log_level {
            self.logging.level = level.to_string();
            tracing::info!("CLI override: log level set to {}", level);
        }
    }
}

fn replace_port(addr: &str, port: u16) -> String {
    match addr.rsplit_once(':') {
        Some((host, _)) => format!("{}:{}", host, port),
        None => format!("{}:{}", addr, port),
    }
}
