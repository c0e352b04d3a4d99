//! Logical byte pipe multiplexed over a connection.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::sync::{mpsc, Mutex};

use super::Inner;
use crate::error::{Result, TaskwireError};
use crate::protocol::Frame;
use crate::writer::OutboundFrame;

struct ReadState {
    rx: mpsc::UnboundedReceiver<Bytes>,
    /// Remainder of the last payload not yet handed out.
    pending: Bytes,
}

/// One end of a numbered channel.
///
/// Reads have stream semantics: frame boundaries are not preserved. There is
/// no per-channel close; a channel lives until its connection closes or the
/// `Channel` is dropped.
pub struct Channel {
    number: u16,
    inner: Arc<Inner>,
    read_state: Mutex<ReadState>,
}

impl Channel {
    pub(super) fn new(number: u16, inner: Arc<Inner>, rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            number,
            inner,
            read_state: Mutex::new(ReadState {
                rx,
                pending: Bytes::new(),
            }),
        }
    }

    #[inline]
    pub fn number(&self) -> u16 {
        self.number
    }

    /// Read up to `max` bytes, waiting until at least one is available.
    ///
    /// Data that arrived before the connection closed is still returned;
    /// after that the close error is.
    pub async fn read(&self, max: usize) -> Result<Bytes> {
        if max == 0 {
            return Ok(Bytes::new());
        }
        let mut state = self.read_state.lock().await;
        if state.pending.is_empty() {
            match state.rx.recv().await {
                Some(payload) => state.pending = payload,
                None => return Err(self.inner.close_error()),
            }
        }
        let n = max.min(state.pending.len());
        Ok(state.pending.split_to(n))
    }

    /// Read exactly `n` bytes.
    pub async fn read_exact(&self, n: usize) -> Result<Bytes> {
        let first = self.read(n).await?;
        if first.len() == n {
            return Ok(first);
        }
        let mut out = BytesMut::with_capacity(n);
        out.extend_from_slice(&first);
        while out.len() < n {
            let chunk = self.read(n - out.len()).await?;
            out.extend_from_slice(&chunk);
        }
        Ok(out.freeze())
    }

    /// Write `data`, split into frames no larger than the connection's
    /// maximum frame size. All fragments are queued together.
    pub async fn write(&self, data: Bytes) -> Result<()> {
        if self.inner.close_reason.get().is_some() {
            return Err(self.inner.close_error());
        }
        if data.is_empty() {
            return Ok(());
        }

        let max = self.inner.config.max_frame_size as usize;
        let mut batch = Vec::with_capacity(data.len().div_ceil(max));
        let mut offset = 0;
        while offset < data.len() {
            let end = (offset + max).min(data.len());
            batch.push(OutboundFrame::from(Frame::channel_data(
                self.number,
                data.slice(offset..end),
            )));
            offset = end;
        }

        self.inner.writer.send_batch(batch).await.map_err(|e| match e {
            TaskwireError::ConnectionClosed => self.inner.close_error(),
            other => other,
        })
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.inner.release_channel(self.number);
    }
}

#[cfg(test)]
mod tests {
    use crate::config::ConnectionConfig;
    use crate::connection::Connection;
    use crate::error::TaskwireError;
    use bytes::Bytes;
    use tokio::io::duplex;

    fn pair(max_frame_size: u32) -> (Connection, Connection) {
        let config = ConnectionConfig::default()
            .with_heartbeat(0, 0)
            .with_max_frame_size(max_frame_size);
        let (a, b) = duplex(1024 * 1024);
        (
            Connection::initiate(a, config.clone()),
            Connection::accept(b, config),
        )
    }

    #[tokio::test]
    async fn test_large_write_is_fragmented_and_reassembled() {
        let (client, server) = pair(1024);
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();

        client
            .channel(20)
            .unwrap()
            .write(Bytes::from(data.clone()))
            .await
            .unwrap();

        let ch = server.accept_channel().await.unwrap();
        // No single read can exceed one frame's payload.
        let first = ch.read(usize::MAX).await.unwrap();
        assert!(first.len() <= 1024);
        let rest = ch.read_exact(data.len() - first.len()).await.unwrap();
        let mut all = first.to_vec();
        all.extend_from_slice(&rest);
        assert_eq!(all, data);
    }

    #[tokio::test]
    async fn test_order_preserved_per_channel() {
        let (client, server) = pair(8);
        let out = client.channel(20).unwrap();
        out.write(Bytes::from_static(b"AAAAAAAAAAAAAAAAAAAA")).await.unwrap();
        out.write(Bytes::from_static(b"BBBBBBBBBBBB")).await.unwrap();

        let ch = server.accept_channel().await.unwrap();
        let got = ch.read_exact(32).await.unwrap();
        assert_eq!(&got[..], b"AAAAAAAAAAAAAAAAAAAABBBBBBBBBBBB");
    }

    #[tokio::test]
    async fn test_read_returns_partial_data() {
        let (client, server) = pair(1024);
        client
            .channel(20)
            .unwrap()
            .write(Bytes::from_static(b"abc"))
            .await
            .unwrap();

        let ch = server.accept_channel().await.unwrap();
        assert_eq!(&ch.read(2).await.unwrap()[..], b"ab");
        assert_eq!(&ch.read(10).await.unwrap()[..], b"c");
    }

    #[tokio::test]
    async fn test_buffered_data_drains_before_close_error() {
        let (client, server) = pair(1024);
        let ch = client.channel(20).unwrap();
        let out = server.channel(20).unwrap();
        out.write(Bytes::from_static(b"last words")).await.unwrap();
        server.close();
        client.closed().await;

        assert_eq!(&ch.read(64).await.unwrap()[..], b"last words");
        assert!(matches!(
            ch.read(64).await,
            Err(TaskwireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (client, _server) = pair(1024);
        let ch = client.channel(20).unwrap();
        client.close();
        assert!(matches!(
            ch.write(Bytes::from_static(b"x")).await,
            Err(TaskwireError::ConnectionClosed)
        ));
    }
}
