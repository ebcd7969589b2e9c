//! Logging consumer for routed messages

use tracing::info;

use super::MessageReceiver;

/// The single long-lived consumer of the message channel
pub struct MessageLog {
    receiver: MessageReceiver,
}

impl MessageLog {
    pub fn new(receiver: MessageReceiver) -> Self {
        Self { receiver }
    }

    /// Log every message in arrival order until the channel is closed and
    /// drained. Returns how many messages were consumed.
    pub async fn run(mut self) -> u64 {
        let mut consumed = 0u64;

        while let Some(message) = self.receiver.recv().await {
            info!("{}", message);
            consumed += 1;
        }

        info!(consumed, "Message channel closed, consumer exiting");
        consumed
    }
}
