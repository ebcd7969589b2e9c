//! Connection counters shared between the server and its tasks

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct ServerStats {
    accepted: AtomicU64,
    active: AtomicUsize,
    closed: AtomicU64,
    accept_errors: AtomicU64,
    bytes_read: AtomicU64,
    messages_routed: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub active: usize,
    pub closed: u64,
    pub accept_errors: u64,
    pub bytes_read: u64,
    pub messages_routed: u64,
}

impl ServerStats {
    pub fn active_connections(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            accept_errors: self.accept_errors.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn record_accept_error(&self) {
        self.accept_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read(&self, bytes: usize) {
        self.bytes_read.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_message(&self) {
        self.messages_routed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Counts a connection as active for as long as it is alive, including when
/// its task is aborted.
pub(crate) struct ConnectionGuard {
    stats: Arc<ServerStats>,
}

impl ConnectionGuard {
    pub(crate) fn open(stats: Arc<ServerStats>) -> Self {
        stats.accepted.fetch_add(1, Ordering::Relaxed);
        stats.active.fetch_add(1, Ordering::Relaxed);
        Self { stats }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.stats.active.fetch_sub(1, Ordering::Relaxed);
        self.stats.closed.fetch_add(1, Ordering::Relaxed);
    }
}
