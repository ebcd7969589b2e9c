//! connserver
//!
//! A minimal TCP connection server. Every accepted connection gets its own
//! read task; in routing mode each read is handed to a single logging
//! consumer over a rendezvous channel and acknowledged to the peer.

pub mod config;
pub mod connection;
pub mod message;
pub mod shutdown;

pub use config::Config;
pub use connection::{Server, ServerError};
pub use message::{Message, MessageLog};
pub use shutdown::ShutdownCoordinator;

/// Application-level result type
pub type Result<T> = anyhow::Result<T>;
