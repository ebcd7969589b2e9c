//! Low-level TCP bind, the accept source, and the accept-error policy

use async_trait::async_trait;
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};

use super::ServerError;

/// Anything the accept loop can pull connections from
#[async_trait]
pub trait Acceptor: Send + Sync {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)>;
}

#[async_trait]
impl Acceptor for TcpListener {
    async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        TcpListener::accept(self).await
    }
}

/// How the accept loop should treat a failed `accept`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptErrorKind {
    /// The failure belongs to one incoming connection; accept again immediately.
    Transient,
    /// The process or system ran out of descriptors or buffers. Usually recovers.
    Exhausted,
    /// The listener itself is broken.
    Persistent,
}

/// What the accept loop does after an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptAction {
    Continue,
    Backoff,
    GiveUp,
}

pub fn classify_accept_error(err: &io::Error) -> AcceptErrorKind {
    if is_resource_exhaustion(err) {
        return AcceptErrorKind::Exhausted;
    }

    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => AcceptErrorKind::Transient,
        io::ErrorKind::OutOfMemory => AcceptErrorKind::Exhausted,
        _ => AcceptErrorKind::Persistent,
    }
}

#[cfg(unix)]
fn is_resource_exhaustion(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn is_resource_exhaustion(_err: &io::Error) -> bool {
    false
}

/// Counts consecutive persistent accept failures.
///
/// Only persistent errors count towards `max`; exhaustion backs off without
/// ever giving up, and a successful accept resets the count.
#[derive(Debug)]
pub struct AcceptErrors {
    consecutive: u32,
    max: u32,
}

impl AcceptErrors {
    pub fn new(max: u32) -> Self {
        Self { consecutive: 0, max }
    }

    pub fn record(&mut self, err: &io::Error) -> AcceptAction {
        match classify_accept_error(err) {
            AcceptErrorKind::Transient => AcceptAction::Continue,
            AcceptErrorKind::Exhausted => AcceptAction::Backoff,
            AcceptErrorKind::Persistent => {
                self.consecutive += 1;
                if self.consecutive >= self.max {
                    AcceptAction::GiveUp
                } else {
                    AcceptAction::Backoff
                }
            }
        }
    }

    pub fn reset(&mut self) {
        self.consecutive = 0;
    }

    pub fn consecutive(&self) -> u32 {
        self.consecutive
    }
}

/// Expand the `":PORT"` shorthand to all interfaces.
pub fn normalize_listen_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{}", addr)
    } else {
        addr.to_string()
    }
}

pub async fn bind_tcp(addr: &str) -> Result<TcpListener, ServerError> {
    let resolved = normalize_listen_addr(addr);
    TcpListener::bind(resolved.as_str())
        .await
        .map_err(|source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        })
}
