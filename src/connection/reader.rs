//! Per-connection read loop

use bytes::Bytes;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use super::ServerStats;
use crate::message::{Message, MessageSender};
use crate::shutdown::ShutdownListener;

/// Why a connection left the `Open` state
#[derive(Debug)]
pub enum CloseReason {
    /// End of stream
    PeerClosed,
    ReadFailed(io::Error),
    /// The acknowledgement could not be written back
    WriteFailed(io::Error),
    /// The consumer is gone
    ChannelClosed,
    Shutdown,
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => f.write_str("peer closed the connection"),
            CloseReason::ReadFailed(e) => write!(f, "read error: {}", e),
            CloseReason::WriteFailed(e) => write!(f, "write error: {}", e),
            CloseReason::ChannelClosed => f.write_str("message channel closed"),
            CloseReason::Shutdown => f.write_str("server shutting down"),
        }
    }
}

/// What every read task of one server shares
pub(crate) struct ConnectionContext {
    pub buffer_size: usize,
    /// `None` in log-only mode
    pub router: Option<MessageSender>,
    pub stats: Arc<ServerStats>,
}

/// The text written back after each routed read
pub fn acknowledgement(peer: SocketAddr) -> String {
    format!("Received, {}!\n", peer)
}

/// Run one connection until it closes, returning why it did.
///
/// Each iteration reads at most `buffer_size` bytes; there is no framing, so
/// a large write from the peer arrives as several messages.
pub(crate) async fn serve_connection<S>(
    mut stream: S,
    peer: SocketAddr,
    ctx: &ConnectionContext,
    shutdown: &mut ShutdownListener,
) -> CloseReason
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; ctx.buffer_size];

    loop {
        let n = tokio::select! {
            biased;
            _ = shutdown.recv() => return CloseReason::Shutdown,
            read = stream.read(&mut buf) => match read {
                Ok(0) => return CloseReason::PeerClosed,
                Ok(n) => n,
                Err(e) => return CloseReason::ReadFailed(e),
            },
        };
        ctx.stats.record_read(n);

        let Some(router) = &ctx.router else {
            info!(peer = %peer, "{}", String::from_utf8_lossy(&buf[..n]));
            continue;
        };

        let message = Message::new(peer, Bytes::copy_from_slice(&buf[..n]));
        tokio::select! {
            biased;
            _ = shutdown.recv() => return CloseReason::Shutdown,
            sent = router.send(message) => {
                if sent.is_err() {
                    return CloseReason::ChannelClosed;
                }
            }
        }
        ctx.stats.record_message();
        debug!(peer = %peer, bytes = n, "Routed message");

        let ack = acknowledgement(peer);
        tokio::select! {
            biased;
            _ = shutdown.recv() => return CloseReason::Shutdown,
            written = stream.write_all(ack.as_bytes()) => {
                if let Err(e) = written {
                    return CloseReason::WriteFailed(e);
                }
            }
        }
    }
}
