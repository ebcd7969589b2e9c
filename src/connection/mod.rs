//! Connection Module
//!
//! TCP bind, the accept loop and the per-connection read loop.

pub mod error;
pub mod listener;
pub mod reader;
pub mod server;
pub mod stats;

pub use error::ServerError;
pub use listener::{
    classify_accept_error, AcceptAction, AcceptErrorKind, AcceptErrors, Acceptor,
};
pub use reader::{acknowledgement, CloseReason};
pub use server::Server;
pub use stats::{ServerStats, StatsSnapshot};
