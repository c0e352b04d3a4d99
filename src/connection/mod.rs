//! Multiplexed connection over a single byte stream.
//!
//! A [`Connection`] owns one stream (TLS in production, an in-memory duplex
//! in tests) and runs three background tasks:
//!
//! 1. **Reader**: decodes frames and routes `ChannelData` into per-channel
//!    queues, handles `Disconnect`, `Heartbeat` and `Debug` frames, and
//!    enforces the heartbeat timeout.
//! 2. **Writer**: the single write path (see [`crate::writer`]).
//! 3. **Heartbeat**: emits a `Heartbeat` frame every interval.
//!
//! A connection is Open until it closes for any reason, after which it is
//! Closed for good: every channel read returns the close error once its
//! buffered data is drained and new channels cannot be opened.
//!
//! # Example
//!
//! ```ignore
//! use taskwire::connection::Connection;
//! use taskwire::protocol::channels;
//!
//! let conn = Connection::initiate(stream, config);
//! let task = conn.channel(channels::TASK)?;
//! task.write(Bytes::from_static(b"ping")).await?;
//! let reply = task.read(1024).await?;
//! conn.close();
//! ```

mod channel;

pub use channel::Channel;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ConnectionConfig;
use crate::error::{Result, TaskwireError};
use crate::protocol::{Frame, FrameBuffer, FrameType, DEFAULT_MAX_FRAME_SIZE};
use crate::writer::{spawn_writer_task, WriterHandle};

/// Receives `Debug` frames. They never reach channel consumers.
pub trait DiagnosticSink: Send + Sync + 'static {
    fn debug_frame(&self, peer: &str, text: &str);
}

/// Why a connection closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `close()` was called locally.
    Local,
    /// The peer sent `Disconnect` or ended the stream cleanly.
    Remote,
    /// Nothing arrived within the heartbeat timeout.
    HeartbeatTimeout,
    /// The peer sent bytes that are not a valid frame.
    Malformed(String),
    /// The stream failed.
    Io(String),
}

impl CloseReason {
    /// Error reported to channel users after closure.
    pub fn to_error(&self) -> TaskwireError {
        match self {
            Self::HeartbeatTimeout => TaskwireError::HeartbeatTimeout,
            Self::Malformed(detail) => TaskwireError::MalformedFrame(detail.clone()),
            Self::Local | Self::Remote | Self::Io(_) => TaskwireError::ConnectionClosed,
        }
    }
}

struct ChannelSlot {
    tx: mpsc::UnboundedSender<Bytes>,
    rx: Option<mpsc::UnboundedReceiver<Bytes>>,
}

impl ChannelSlot {
    fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self { tx, rx: Some(rx) }
    }
}

struct Inner {
    peer: String,
    config: ConnectionConfig,
    passive: bool,
    writer: WriterHandle,
    channels: Mutex<HashMap<u16, ChannelSlot>>,
    incoming_tx: mpsc::UnboundedSender<u16>,
    incoming_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<u16>>,
    close_reason: OnceLock<CloseReason>,
    closed: CancellationToken,
    diagnostics: Option<Arc<dyn DiagnosticSink>>,
}

impl Inner {
    fn close_error(&self) -> TaskwireError {
        self.close_reason
            .get()
            .map(CloseReason::to_error)
            .unwrap_or(TaskwireError::ConnectionClosed)
    }

    fn shutdown(&self, reason: CloseReason) {
        if self.close_reason.set(reason.clone()).is_err() {
            return;
        }
        match &reason {
            CloseReason::Local | CloseReason::Remote => {
                tracing::debug!(peer = %self.peer, ?reason, "Connection closed")
            }
            _ => tracing::warn!(peer = %self.peer, ?reason, "Connection closed"),
        }

        // Best effort: the writer may already be gone.
        let _ = self.writer.push(Frame::disconnect());
        self.closed.cancel();
        if let Ok(mut channels) = self.channels.lock() {
            channels.clear();
        }
    }

    fn open_channel(&self, number: u16) -> Result<mpsc::UnboundedReceiver<Bytes>> {
        let mut channels = self
            .channels
            .lock()
            .map_err(|_| TaskwireError::ConnectionClosed)?;
        if self.close_reason.get().is_some() {
            return Err(self.close_error());
        }
        channels
            .entry(number)
            .or_insert_with(ChannelSlot::new)
            .rx
            .take()
            .ok_or(TaskwireError::ChannelInUse(number))
    }

    fn release_channel(&self, number: u16) {
        if let Ok(mut channels) = self.channels.lock() {
            channels.remove(&number);
        }
    }

    fn route(&self, channel: u16, payload: Bytes) {
        if payload.is_empty() {
            return;
        }
        let Ok(mut channels) = self.channels.lock() else {
            return;
        };
        if let Some(slot) = channels.get(&channel) {
            let _ = slot.tx.send(payload);
            return;
        }
        if !self.passive {
            tracing::warn!(peer = %self.peer, channel, "Dropping data for unopened channel");
            return;
        }
        let slot = ChannelSlot::new();
        let _ = slot.tx.send(payload);
        channels.insert(channel, slot);
        tracing::debug!(peer = %self.peer, channel, "Peer opened channel");
        let _ = self.incoming_tx.send(channel);
    }

    fn on_debug(&self, payload: &[u8]) {
        let text = String::from_utf8_lossy(payload);
        match &self.diagnostics {
            Some(sink) => sink.debug_frame(&self.peer, &text),
            None => tracing::debug!(peer = %self.peer, text = %text, "Debug frame"),
        }
    }
}

/// Builder for a [`Connection`].
pub struct ConnectionBuilder {
    config: ConnectionConfig,
    passive: bool,
    peer: String,
    diagnostics: Option<Arc<dyn DiagnosticSink>>,
}

impl ConnectionBuilder {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            passive: false,
            peer: "peer".to_string(),
            diagnostics: None,
        }
    }

    /// Create channels on first inbound reference (server side).
    pub fn passive_channels(mut self, passive: bool) -> Self {
        self.passive = passive;
        self
    }

    /// Label used in log fields.
    pub fn peer(mut self, peer: impl Into<String>) -> Self {
        self.peer = peer.into();
        self
    }

    pub fn diagnostics(mut self, sink: Arc<dyn DiagnosticSink>) -> Self {
        self.diagnostics = Some(sink);
        self
    }

    /// Take ownership of the stream and start the background tasks.
    ///
    /// Must be called inside a tokio runtime.
    pub fn start<S>(mut self, stream: S) -> Connection
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        if let Err(e) = self.config.validate() {
            tracing::warn!(peer = %self.peer, error = %e, "Connection config rejected, using defaults where needed");
        }
        if self.config.max_frame_size == 0 {
            self.config.max_frame_size = DEFAULT_MAX_FRAME_SIZE;
        }

        let (read_half, write_half) = tokio::io::split(stream);
        let (writer, writer_task) = spawn_writer_task(write_half, self.config.writer_config());
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            peer: self.peer,
            passive: self.passive,
            writer,
            channels: Mutex::new(HashMap::new()),
            incoming_tx,
            incoming_rx: tokio::sync::Mutex::new(incoming_rx),
            close_reason: OnceLock::new(),
            closed: CancellationToken::new(),
            diagnostics: self.diagnostics,
            config: self.config,
        });

        tokio::spawn(reader_loop(inner.clone(), read_half));

        if let Some(interval) = inner.config.heartbeat_interval() {
            let announced = inner.config.heartbeat_timeout().unwrap_or(Duration::ZERO);
            tokio::spawn(heartbeat_loop(inner.clone(), interval, announced));
        }

        let supervised = inner.clone();
        tokio::spawn(async move {
            match writer_task.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => supervised.shutdown(CloseReason::Io(e.to_string())),
                Err(e) => supervised.shutdown(CloseReason::Io(e.to_string())),
            }
        });

        tracing::debug!(peer = %inner.peer, passive = inner.passive, "Connection open");
        Connection { inner }
    }
}

/// One multiplexed connection. Cheap to clone; clones share the stream.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn builder(config: ConnectionConfig) -> ConnectionBuilder {
        ConnectionBuilder::new(config)
    }

    /// Start a connection on a stream we dialed. Channels must be opened
    /// before the peer sends on them.
    pub fn initiate<S>(stream: S, config: ConnectionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        ConnectionBuilder::new(config).start(stream)
    }

    /// Start a connection on a stream we accepted. Channels the peer sends on
    /// are created on demand and announced by [`accept_channel`](Self::accept_channel).
    pub fn accept<S>(stream: S, config: ConnectionConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        ConnectionBuilder::new(config)
            .passive_channels(true)
            .start(stream)
    }

    /// Open channel `number`. Each number has one reader per connection.
    pub fn channel(&self, number: u16) -> Result<Channel> {
        let rx = self.inner.open_channel(number)?;
        Ok(Channel::new(number, self.inner.clone(), rx))
    }

    /// Wait for the peer to start using a channel we have not opened.
    ///
    /// Returns `None` once the connection is closed.
    pub async fn accept_channel(&self) -> Option<Channel> {
        let mut incoming = self.inner.incoming_rx.lock().await;
        loop {
            let number = tokio::select! {
                _ = self.inner.closed.cancelled() => return None,
                number = incoming.recv() => number?,
            };
            match self.channel(number) {
                Ok(channel) => return Some(channel),
                Err(TaskwireError::ChannelInUse(_)) => continue,
                Err(_) => return None,
            }
        }
    }

    /// Send a `Debug` frame to the peer's diagnostic sink.
    pub async fn send_debug(&self, text: &str) -> Result<()> {
        if self.is_closed() {
            return Err(self.inner.close_error());
        }
        self.inner.writer.send(Frame::debug(text)).await
    }

    /// Close the connection. Idempotent; safe from any task.
    pub fn close(&self) {
        self.inner.shutdown(CloseReason::Local);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.close_reason.get().is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.inner.close_reason.get().cloned()
    }

    /// Wait until the connection is closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    /// Error a channel operation reports on this closed connection.
    pub fn close_error(&self) -> TaskwireError {
        self.inner.close_error()
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.inner.config
    }
}

async fn reader_loop<R>(inner: Arc<Inner>, mut reader: R)
where
    R: AsyncRead + Unpin,
{
    let mut buffer = FrameBuffer::with_max_frame_size(inner.config.max_frame_size);
    let mut buf = vec![0u8; 64 * 1024];
    let heartbeat_timeout = inner.config.heartbeat_timeout();
    let mut last_frame = Instant::now();

    let reason = 'read: loop {
        let read = reader.read(&mut buf);
        let result = match heartbeat_timeout {
            Some(timeout) => tokio::select! {
                _ = inner.closed.cancelled() => return,
                result = tokio::time::timeout_at(last_frame + timeout, read) => match result {
                    Ok(result) => result,
                    Err(_) => break 'read CloseReason::HeartbeatTimeout,
                },
            },
            None => tokio::select! {
                _ = inner.closed.cancelled() => return,
                result = read => result,
            },
        };

        let n = match result {
            Ok(0) => match buffer.finish() {
                Ok(()) => break 'read CloseReason::Remote,
                Err(e) => break 'read CloseReason::Malformed(e.to_string()),
            },
            Ok(n) => n,
            Err(e) => break 'read CloseReason::Io(e.to_string()),
        };

        let frames = match buffer.push(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => break 'read CloseReason::Malformed(e.to_string()),
        };
        if !frames.is_empty() {
            last_frame = Instant::now();
        }

        for frame in frames {
            match frame.frame_type {
                FrameType::ChannelData => inner.route(frame.channel, frame.payload),
                FrameType::Disconnect => break 'read CloseReason::Remote,
                FrameType::Heartbeat => {
                    tracing::trace!(peer = %inner.peer, peer_timeout = ?frame.heartbeat_timeout(), "Heartbeat")
                }
                FrameType::Debug => inner.on_debug(&frame.payload),
            }
        }
    };

    inner.shutdown(reason);
}

async fn heartbeat_loop(inner: Arc<Inner>, interval: Duration, announced: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = inner.closed.cancelled() => return,
            _ = ticker.tick() => {
                if inner.writer.push(Frame::heartbeat(announced)).is_err() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    fn quiet() -> ConnectionConfig {
        ConnectionConfig::default().with_heartbeat(0, 0)
    }

    fn pair(config: ConnectionConfig) -> (Connection, Connection) {
        let (a, b) = duplex(256 * 1024);
        (
            Connection::initiate(a, config.clone()),
            Connection::accept(b, config),
        )
    }

    #[tokio::test]
    async fn test_bytes_flow_between_peers() {
        let (client, server) = pair(quiet());
        let tx = client.channel(20).unwrap();
        tx.write(Bytes::from_static(b"hello")).await.unwrap();

        let rx = server.accept_channel().await.unwrap();
        assert_eq!(rx.number(), 20);
        assert_eq!(&rx.read_exact(5).await.unwrap()[..], b"hello");
    }

    #[tokio::test]
    async fn test_zero_frame_size_falls_back_to_default() {
        let (a, b) = duplex(256 * 1024);
        let client = Connection::initiate(a, quiet().with_max_frame_size(0));
        let server = Connection::accept(b, quiet());
        assert_eq!(client.config().max_frame_size, DEFAULT_MAX_FRAME_SIZE);

        let tx = client.channel(20).unwrap();
        tx.write(Bytes::from_static(b"xyz")).await.unwrap();
        let rx = server.accept_channel().await.unwrap();
        assert_eq!(&rx.read_exact(3).await.unwrap()[..], b"xyz");
    }

    #[tokio::test]
    async fn test_channel_in_use() {
        let (client, _server) = pair(quiet());
        let _first = client.channel(21).unwrap();
        assert!(matches!(
            client.channel(21),
            Err(TaskwireError::ChannelInUse(21))
        ));
    }

    #[tokio::test]
    async fn test_dropped_channel_can_be_reopened() {
        let (client, _server) = pair(quiet());
        drop(client.channel(21).unwrap());
        assert!(client.channel(21).is_ok());
    }

    #[tokio::test]
    async fn test_initiated_connection_drops_unopened_channel_data() {
        let (client, server) = pair(quiet());
        let out = server.channel(30).unwrap();
        out.write(Bytes::from_static(b"lost")).await.unwrap();
        out.write(Bytes::from_static(b"x")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        // Opened after the data arrived: the earlier frames were discarded.
        let late = client.channel(30).unwrap();
        out.write(Bytes::from_static(b"kept")).await.unwrap();
        assert_eq!(&late.read(64).await.unwrap()[..], b"kept");
    }

    #[tokio::test]
    async fn test_remote_close_wakes_blocked_reader() {
        let (client, server) = pair(quiet());
        let ch = client.channel(20).unwrap();
        let reader = tokio::spawn(async move { ch.read(16).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        server.close();

        let result = reader.await.unwrap();
        assert!(matches!(result, Err(TaskwireError::ConnectionClosed)));
        client.closed().await;
        assert_eq!(client.close_reason(), Some(CloseReason::Remote));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, _server) = pair(quiet());
        client.close();
        client.close();
        assert_eq!(client.close_reason(), Some(CloseReason::Local));
        assert!(matches!(
            client.channel(20),
            Err(TaskwireError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_heartbeat_timeout_closes_connection() {
        // The raw end never sends a frame.
        let (a, _raw) = duplex(64 * 1024);
        let config = ConnectionConfig::default().with_heartbeat(20, 100);
        let conn = Connection::initiate(a, config);
        let ch = conn.channel(20).unwrap();

        let started = std::time::Instant::now();
        let result = ch.read(16).await;
        let elapsed = started.elapsed();

        assert!(matches!(result, Err(TaskwireError::HeartbeatTimeout)));
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed < Duration::from_millis(200));
        assert_eq!(conn.close_reason(), Some(CloseReason::HeartbeatTimeout));
    }

    #[tokio::test]
    async fn test_heartbeats_keep_idle_connection_alive() {
        let config = ConnectionConfig::default().with_heartbeat(20, 100);
        let (client, server) = pair(config);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!client.is_closed());
        assert!(!server.is_closed());
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_connection() {
        let (a, mut raw) = duplex(64 * 1024);
        let conn = Connection::initiate(a, quiet());
        let ch = conn.channel(20).unwrap();

        raw.write_all(&[0xEE, 0, 20, 0, 0, 0, 1, 0]).await.unwrap();

        assert!(matches!(
            ch.read(16).await,
            Err(TaskwireError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn test_truncated_stream_is_malformed() {
        let (a, mut raw) = duplex(64 * 1024);
        let conn = Connection::initiate(a, quiet());
        let ch = conn.channel(20).unwrap();

        raw.write_all(&[1, 0, 20, 0, 0, 0, 10, b'a']).await.unwrap();
        drop(raw);

        assert!(matches!(
            ch.read(16).await,
            Err(TaskwireError::MalformedFrame(_))
        ));
    }

    #[tokio::test]
    async fn test_debug_frames_reach_sink_not_channels() {
        struct Collect(Mutex<Vec<String>>);
        impl DiagnosticSink for Collect {
            fn debug_frame(&self, _peer: &str, text: &str) {
                self.0.lock().unwrap().push(text.to_string());
            }
        }

        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        let (a, b) = duplex(64 * 1024);
        let client = Connection::initiate(a, quiet());
        let server = Connection::builder(quiet())
            .passive_channels(true)
            .diagnostics(sink.clone())
            .start(b);

        client.send_debug("resolver cache warm").await.unwrap();
        client.channel(20).unwrap().write(Bytes::from_static(b"x")).await.unwrap();
        let ch = server.accept_channel().await.unwrap();
        assert_eq!(&ch.read(8).await.unwrap()[..], b"x");
        assert_eq!(sink.0.lock().unwrap().as_slice(), ["resolver cache warm"]);
    }
}
