//! Rendezvous channel
//!
//! A send completes only once the receiver has taken the message, so a slow
//! consumer holds back every producer. Built from a depth-one `mpsc` queue and
//! a `oneshot` delivery acknowledgement per message.

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use super::Message;

/// Returned when the receiving side has gone away
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("message channel closed")]
pub struct ChannelClosed;

struct Envelope {
    message: Message,
    delivered: oneshot::Sender<()>,
}

/// Producer half. Cloned into every read task.
#[derive(Clone)]
pub struct MessageSender {
    tx: mpsc::Sender<Envelope>,
}

/// Consumer half. There is exactly one.
pub struct MessageReceiver {
    rx: mpsc::Receiver<Envelope>,
}

/// Create a rendezvous channel
pub fn channel() -> (MessageSender, MessageReceiver) {
    let (tx, rx) = mpsc::channel(1);
    (MessageSender { tx }, MessageReceiver { rx })
}

impl MessageSender {
    /// Hand `message` to the consumer and wait until it has been taken.
    ///
    /// Dropping the returned future before it completes withdraws the
    /// message; the receiver will skip it.
    pub async fn send(&self, message: Message) -> Result<(), ChannelClosed> {
        let (delivered, taken) = oneshot::channel();
        self.tx
            .send(Envelope { message, delivered })
            .await
            .map_err(|_| ChannelClosed)?;
        taken.await.map_err(|_| ChannelClosed)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Release this handle. The channel closes once the last handle is gone.
    pub fn close(self) {
        debug!("Releasing message channel sender");
        drop(self);
    }
}

impl MessageReceiver {
    /// Take the next message, or `None` once every sender is gone and the
    /// queue is drained.
    pub async fn recv(&mut self) -> Option<Message> {
        while let Some(envelope) = self.rx.recv().await {
            if envelope.delivered.send(()).is_ok() {
                return Some(envelope.message);
            }
            debug!(source = %envelope.message.source(), "Skipping withdrawn message");
        }
        None
    }
}
