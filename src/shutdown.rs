//! Shutdown Handling
//!
//! A single-use shutdown signal shared by the server, its accept task and every
//! read task. It fires on SIGTERM/SIGINT (Ctrl+C elsewhere) or when
//! [`ShutdownCoordinator::trigger`] is called.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::Result;

/// Shutdown coordinator shared by every task of a server
#[derive(Clone)]
pub struct ShutdownCoordinator {
    /// Broadcast sender for shutdown signal
    shutdown_tx: broadcast::Sender<()>,
    /// Set before the broadcast so that receivers created afterwards still see it
    triggered: Arc<AtomicBool>,
    /// How long read tasks get to finish once the signal fires
    timeout: Duration,
}

/// Receiving half of the shutdown signal
pub struct ShutdownListener {
    rx: broadcast::Receiver<()>,
    triggered: Arc<AtomicBool>,
}

impl ShutdownCoordinator {
    /// Create a new shutdown coordinator
    pub fn new(timeout: Duration) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shutdown_tx,
            triggered: Arc::new(AtomicBool::new(false)),
            timeout,
        }
    }

    /// Get a listener that resolves once shutdown is triggered
    pub fn subscribe(&self) -> ShutdownListener {
        ShutdownListener {
            rx: self.shutdown_tx.subscribe(),
            triggered: Arc::clone(&self.triggered),
        }
    }

    /// Fire the shutdown signal. Only the first call has any effect.
    pub fn trigger(&self) {
        if self.triggered.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already triggered");
            return;
        }
        // No receivers is fine: nothing is running yet, and later
        // subscribers observe the flag.
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for SIGTERM, SIGINT or Ctrl+C, then trigger shutdown
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
                _ = signal::ctrl_c() => {
                    info!("Received Ctrl+C, initiating graceful shutdown");
                }
            }
        }

        #[cfg(not(unix))]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        self.trigger();
        Ok(())
    }
}

impl ShutdownListener {
    /// Resolve once shutdown has been triggered, including before this call.
    pub async fn recv(&mut self) {
        if self.triggered.load(Ordering::SeqCst) {
            return;
        }
        // Lagged and Closed both mean the signal can no longer be missed or
        // will never come; either way there is nothing left to wait on.
        match self.rx.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => {
                if !self.triggered.load(Ordering::SeqCst) {
                    std::future::pending::<()>().await;
                }
            }
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::SeqCst)
    }
}
