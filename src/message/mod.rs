//! Message Routing Module
//!
//! Messages carry one read's worth of bytes from a read task to the single
//! logging consumer over a rendezvous channel.

pub mod channel;
pub mod consumer;

pub use channel::{channel, ChannelClosed, MessageReceiver, MessageSender};
pub use consumer::MessageLog;

use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;

/// The bytes produced by one read on a connection, tagged with the peer they came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    source: SocketAddr,
    payload: Bytes,
}

impl Message {
    pub fn new(source: SocketAddr, payload: impl Into<Bytes>) -> Self {
        Self {
            source,
            payload: payload.into(),
        }
    }

    pub fn source(&self) -> SocketAddr {
        self.source
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "New Message from {}: {}",
            self.source,
            String::from_utf8_lossy(&self.payload)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_matches_log_line() {
        let msg = Message::new("127.0.0.1:4242".parse().unwrap(), &b"hello"[..]);
        assert_eq!(msg.to_string(), "New Message from 127.0.0.1:4242: hello");
    }

    #[test]
    fn test_display_is_lossy_for_binary_payloads() {
        let msg = Message::new("127.0.0.1:1".parse().unwrap(), vec![b'o', b'k', 0xff]);
        assert_eq!(msg.to_string(), "New Message from 127.0.0.1:1: ok\u{fffd}");
    }
}
