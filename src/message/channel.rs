//! Message exchange over a raw channel: `[tag:1][length:4][body]` envelopes
//! written and read whole.

use tokio::sync::Mutex;

use super::{Message, TypedMessage, ENVELOPE_SIZE, MAX_BODY_SIZE};
use crate::connection::Channel;
use crate::error::{Result, TaskwireError};

/// Typed message exchange over a [`Channel`].
///
/// Sends are one channel write each, so concurrent senders never interleave
/// envelopes. Receives are serialized by an internal lock. A receive dropped
/// mid-message (for example by losing a `select!`) leaves the channel out of
/// step; callers that race a receive should close the connection afterwards.
pub struct MessageChannel {
    channel: Channel,
    read_lock: Mutex<()>,
}

impl MessageChannel {
    pub fn new(channel: Channel) -> Self {
        Self {
            channel,
            read_lock: Mutex::new(()),
        }
    }

    pub fn number(&self) -> u16 {
        self.channel.number()
    }

    pub async fn send(&self, message: &Message) -> Result<()> {
        tracing::trace!(channel = self.channel.number(), message = message.name(), "Send");
        self.channel.write(message.encode()).await
    }

    /// Wait for the next whole message.
    pub async fn receive(&self) -> Result<Message> {
        let _guard = self.read_lock.lock().await;

        let envelope = self.channel.read_exact(ENVELOPE_SIZE).await?;
        let tag = envelope[0];
        let len = u32::from_be_bytes([envelope[1], envelope[2], envelope[3], envelope[4]]) as usize;
        if len > MAX_BODY_SIZE {
            return Err(TaskwireError::Protocol(format!(
                "Message body of {} bytes exceeds limit of {}",
                len, MAX_BODY_SIZE
            )));
        }

        let body = self.channel.read_exact(len).await?;
        let message = Message::decode(tag, body)?;
        tracing::trace!(channel = self.channel.number(), message = message.name(), "Receive");
        Ok(message)
    }

    /// Receive the next message and require it to be a `T`.
    pub async fn receive_typed<T: TypedMessage>(&self) -> Result<T> {
        let message = self.receive().await?;
        T::from_message(message).map_err(|other| TaskwireError::UnexpectedMessageType {
            expected: T::NAME,
            actual: other.name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConnectionConfig;
    use crate::connection::Connection;
    use crate::message::{AssemblyRequest, TaskRequest, TaskResponse};
    use bytes::Bytes;
    use tokio::io::duplex;

    fn pair() -> (MessageChannel, Connection) {
        let config = ConnectionConfig::default()
            .with_heartbeat(0, 0)
            .with_max_frame_size(16);
        let (a, b) = duplex(64 * 1024);
        let client = Connection::initiate(a, config.clone());
        let server = Connection::accept(b, config);
        (MessageChannel::new(client.channel(21).unwrap()), server)
    }

    #[tokio::test]
    async fn test_message_spanning_many_frames() {
        let (client, server) = pair();
        let payload = Bytes::from(vec![7u8; 1000]);
        client
            .send(&TaskRequest { payload: payload.clone() }.into())
            .await
            .unwrap();

        let remote = MessageChannel::new(server.accept_channel().await.unwrap());
        let got: TaskRequest = remote.receive_typed().await.unwrap();
        assert_eq!(got.payload, payload);
    }

    #[tokio::test]
    async fn test_messages_arrive_in_order() {
        let (client, server) = pair();
        for name in ["a", "b", "c"] {
            client
                .send(&AssemblyRequest { name: name.into() }.into())
                .await
                .unwrap();
        }

        let remote = MessageChannel::new(server.accept_channel().await.unwrap());
        for name in ["a", "b", "c"] {
            let got: AssemblyRequest = remote.receive_typed().await.unwrap();
            assert_eq!(got.name, name);
        }
    }

    #[tokio::test]
    async fn test_receive_typed_mismatch() {
        let (client, server) = pair();
        client
            .send(&AssemblyRequest { name: "lib".into() }.into())
            .await
            .unwrap();

        let remote = MessageChannel::new(server.accept_channel().await.unwrap());
        let result = remote.receive_typed::<TaskResponse>().await;
        assert!(matches!(
            result,
            Err(TaskwireError::UnexpectedMessageType {
                expected: "TaskResponse",
                actual: "AssemblyRequest"
            })
        ));
    }

    #[tokio::test]
    async fn test_unknown_tag_on_the_wire() {
        let (client, server) = pair();
        client
            .channel
            .write(Bytes::from_static(&[0xEE, 0, 0, 0, 0]))
            .await
            .unwrap();

        let remote = MessageChannel::new(server.accept_channel().await.unwrap());
        assert!(matches!(
            remote.receive().await,
            Err(TaskwireError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_receive_after_close_reports_transport_error() {
        let (client, server) = pair();
        server.close();
        assert!(matches!(
            client.receive().await,
            Err(TaskwireError::ConnectionClosed)
        ));
    }
}
