//! Server error type

use std::io;

/// Errors surfaced by [`Server`](super::Server)
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The listen address is malformed or unavailable
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The listener kept failing and the accept loop gave up
    #[error("accept loop stopped after {consecutive} consecutive errors: {source}")]
    Accept {
        consecutive: u32,
        #[source]
        source: io::Error,
    },

    #[error("accept task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}
