//! Transport abstraction (§4.0 expansion).
//!
//! The specification assumes an already-authenticated, already-connected, bidirectional,
//! message-oriented channel and explicitly puts the socket/auth handshake that produces one out
//! of scope. `Transport` is the seam that assumption lives at: a `Router` is generic over
//! anything that can hand it one end of such a channel. `ChannelTransport` is the in-memory pair
//! used by the demos and the test suite; a real deployment would instead implement `Transport` in
//! terms of a Unix/TCP socket and the SASL handshake, exactly the part this crate stays out of.

use async_broadcast::{Receiver as BroadcastReceiver, Sender as BroadcastSender};
use async_lock::Mutex as AsyncMutex;
use futures_util::lock::Mutex as FuturesMutex;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::message::Message;

/// One end of an authenticated, bidirectional, message-oriented channel.
///
/// Implementations only need to move already-decoded `Message` values; byte-level framing,
/// endianness and authentication live below this trait (Non-goal, §1).
#[async_trait::async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send one message. Resolves once the message has been handed off, not once a peer has
    /// acted on it.
    async fn send(&self, message: Message) -> Result<()>;

    /// Receive the next inbound message, blocking until one arrives or the transport closes.
    async fn receive(&self) -> Result<Message>;

    /// The unique name the bus assigned this connection, once known.
    fn unique_name(&self) -> Option<String> {
        None
    }
}

/// An in-memory, in-process `Transport` pair, used by the demos (§8.2) and the integration tests
/// in place of a real bus connection. Two `ChannelTransport`s constructed via [`pair`] forward
/// messages directly to one another's inbound queue.
pub struct ChannelTransport {
    outbox: BroadcastSender<Message>,
    inbox: FuturesMutex<BroadcastReceiver<Message>>,
    unique_name: AsyncMutex<Option<String>>,
}

impl ChannelTransport {
    /// Build two linked transports, as if each were a distinct peer on the same bus.
    pub fn pair() -> (Arc<ChannelTransport>, Arc<ChannelTransport>) {
        let (tx_a, rx_a) = async_broadcast::broadcast(64);
        let (tx_b, rx_b) = async_broadcast::broadcast(64);

        let a = Arc::new(ChannelTransport {
            outbox: tx_a,
            inbox: FuturesMutex::new(rx_b),
            unique_name: AsyncMutex::new(None),
        });
        let b = Arc::new(ChannelTransport {
            outbox: tx_b,
            inbox: FuturesMutex::new(rx_a),
            unique_name: AsyncMutex::new(None),
        });
        (a, b)
    }

    /// Record the unique name assigned during the `Hello` handshake (§6).
    pub async fn set_unique_name(&self, name: String) {
        *self.unique_name.lock().await = Some(name);
    }
}

#[async_trait::async_trait]
impl Transport for ChannelTransport {
    async fn send(&self, message: Message) -> Result<()> {
        self.outbox
            .broadcast(message)
            .await
            .map_err(|e| Error::Io(e.to_string()))?;
        Ok(())
    }

    async fn receive(&self) -> Result<Message> {
        let mut inbox = self.inbox.lock().await;
        inbox
            .recv()
            .await
            .map_err(|e| Error::Io(format!("transport closed: {e}")))
    }

    fn unique_name(&self) -> Option<String> {
        self.unique_name
            .try_lock()
            .ok()
            .and_then(|guard| guard.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageBuilder;

    #[test]
    fn pair_forwards_messages_between_ends() {
        async_io::block_on(async {
            let (a, b) = ChannelTransport::pair();
            let msg = MessageBuilder::method_call("/com/example/Foo", "Ping")
                .unwrap()
                .build(String::new(), vec![]);
            a.send(msg).await.unwrap();
            let received = b.receive().await.unwrap();
            assert_eq!(received.member().unwrap().as_str(), "Ping");
        });
    }
}
