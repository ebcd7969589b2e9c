//! connserver - minimal TCP connection server
//!
//! Accepts TCP connections, reads raw bytes from each one in its own task and
//! either routes every read to a logging consumer (acknowledging it to the
//! peer) or just logs it.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use tracing::{error, info};
use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

use connserver::{
    config::{Config, ConfigManager, ServerMode},
    MessageLog, Server, ShutdownCoordinator,
};

/// CLI arguments for connserver
#[derive(Parser, Debug)]
#[command(name = "connserver")]
#[command(about = "Minimal TCP connection server")]
#[command(version)]
#[command(long_about = "
Minimal TCP connection server.

In route mode every read is handed to a single logging consumer and the peer
receives `Received, <address>!` for it. In log-only mode reads are logged and
nothing is written back.

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  CONNSERVER_BIND_ADDR        - Listen address (e.g., :3000, 127.0.0.1:3000)
  CONNSERVER_MODE             - route or log-only
  CONNSERVER_BUFFER_SIZE      - Maximum bytes per read
  CONNSERVER_SHUTDOWN_TIMEOUT - Grace period for open connections (e.g., 5s)
  CONNSERVER_LOG_LEVEL        - Log level (trace, debug, info, warn, error)
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(
        short,
        long,
        default_value = "connserver.toml",
        help = "Path to configuration file"
    )]
    pub config: PathBuf,

    /// Bind address (overrides config file)
    #[arg(short, long, help = "Bind address (e.g., :3000 or 127.0.0.1:3000)")]
    pub bind: Option<String>,

    /// Port to bind to (overrides config file)
    #[arg(short, long, help = "Port to bind to")]
    pub port: Option<u16>,

    /// Server mode (overrides config file)
    #[arg(short, long, help = "Server mode: route or log-only")]
    pub mode: Option<ServerMode>,

    /// Buffer size in bytes
    #[arg(long, help = "Maximum bytes per read")]
    pub buffer_size: Option<usize>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    let cli_log_level = if args.verbose {
        Some("debug")
    } else {
        args.log_level.as_deref()
    };

    // Start at the CLI level (or info) so configuration loading is logged,
    // then switch to the configured level once it is known.
    let log_filter = init_tracing(cli_log_level.unwrap_or("info"));

    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    config.merge_with_cli_args(
        args.bind.as_deref(),
        args.port,
        args.mode,
        args.buffer_size,
        cli_log_level,
    );

    config
        .validate()
        .context("Final configuration validation failed")?;

    if let Some(handle) = log_filter {
        handle
            .reload(EnvFilter::new(&config.logging.level))
            .context("Failed to apply configured log level")?;
    }

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Bind address: {}", config.server.bind_addr);
        info!("  Mode: {}", config.server.mode);
        info!("  Buffer size: {} bytes", config.server.buffer_size);
        info!("  Shutdown timeout: {:?}", config.server.shutdown_timeout);
        return Ok(());
    }

    info!(
        "Starting connserver v{} ({} mode)",
        env!("CARGO_PKG_VERSION"),
        config.server.mode
    );

    run(config).await
}

async fn run(config: Config) -> Result<()> {
    let shutdown = ShutdownCoordinator::new(config.server.shutdown_timeout);
    let (server, receiver) = Server::from_config(config.server, shutdown.clone());

    let consumer = receiver.map(|rx| tokio::spawn(MessageLog::new(rx).run()));

    let signals = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = signals.listen_for_signals().await {
            error!("Error setting up signal handlers: {}", e);
        }
    });

    let result = server.start().await;

    if let Some(consumer) = consumer {
        match consumer.await {
            Ok(consumed) => info!("Consumer finished after {} messages", consumed),
            Err(e) => error!("Consumer task failed: {}", e),
        }
    }

    result.context("Server terminated with an error")?;
    info!("Server shutdown complete");
    Ok(())
}

/// Initialize tracing/logging.
///
/// Returns a handle for changing the level later, or `None` when `RUST_LOG`
/// decides the filter.
fn init_tracing(log_level: &str) -> Option<reload::Handle<EnvFilter, Registry>> {
    let from_env = EnvFilter::try_from_default_env().ok();
    let reloadable = from_env.is_none();
    let env_filter = from_env.unwrap_or_else(|| EnvFilter::new(log_level));
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .init();

    reloadable.then_some(handle)
}
