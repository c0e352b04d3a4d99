//! Dedicated writer task: the single write path of a connection.
//!
//! Every frame a connection sends (channel data, heartbeats, debug text,
//! the final disconnect) goes through one mpsc queue into one task that owns
//! the write half of the stream. Frames are therefore never interleaved on
//! the wire, and a multi-frame channel write enqueued as one batch stays
//! contiguous.
//!
//! # Architecture
//!
//! ```text
//! Channel 20 ──┐
//! Channel 21 ──┼─► mpsc::UnboundedSender<Vec<OutboundFrame>> ─► Writer Task ─► Stream
//! Heartbeat ───┘
//! ```
//!
//! The queue is unbounded by default. Setting `max_pending_frames` turns on
//! backpressure: senders wait for the writer to drain below the limit and
//! fail with `BackpressureTimeout` if it does not within the timeout.

use std::io::IoSlice;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Result, TaskwireError};
use crate::protocol::{Frame, FrameType, HEADER_SIZE};

/// Default backpressure timeout.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames to batch in a single write operation.
const MAX_BATCH_SIZE: usize = 64;

/// A frame ready to be written to the stream.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Pre-encoded header (7 bytes).
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes.
    pub payload: Bytes,
    frame_type: FrameType,
}

impl OutboundFrame {
    /// Total size of this frame (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    #[inline]
    fn is_disconnect(&self) -> bool {
        self.frame_type == FrameType::Disconnect
    }
}

impl From<Frame> for OutboundFrame {
    fn from(frame: Frame) -> Self {
        Self {
            header: frame.header().encode(),
            frame_type: frame.frame_type,
            payload: frame.payload,
        }
    }
}

/// Configuration for the writer task.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Pending frames allowed before senders wait. `None` means unbounded.
    pub max_pending_frames: Option<usize>,
    /// Timeout when waiting for backpressure to clear.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: None,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// Handle for sending frames to the writer task.
///
/// Cheaply cloneable; shared by every channel of a connection.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::UnboundedSender<Vec<OutboundFrame>>,
    pending: Arc<AtomicUsize>,
    max_pending: Option<usize>,
    timeout: Duration,
}

impl WriterHandle {
    /// Send a single frame.
    pub async fn send(&self, frame: Frame) -> Result<()> {
        self.send_batch(vec![frame.into()]).await
    }

    /// Send frames that must reach the wire back to back.
    pub async fn send_batch(&self, batch: Vec<OutboundFrame>) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        if let Some(max) = self.max_pending {
            if self.pending.load(Ordering::Acquire) >= max {
                self.wait_for_backpressure(max).await?;
            }
        }

        let count = batch.len();
        self.pending.fetch_add(count, Ordering::AcqRel);
        self.tx.send(batch).map_err(|_| {
            self.pending.fetch_sub(count, Ordering::Release);
            TaskwireError::ConnectionClosed
        })
    }

    /// Enqueue a frame immediately, ignoring the backpressure limit.
    ///
    /// Used for connection-level frames (heartbeat, disconnect) that must
    /// not wait behind channel data.
    pub fn push(&self, frame: Frame) -> Result<()> {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.tx.send(vec![frame.into()]).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::Release);
            TaskwireError::ConnectionClosed
        })
    }

    async fn wait_for_backpressure(&self, max: usize) -> Result<()> {
        let start = Instant::now();
        let check_interval = Duration::from_micros(100);

        loop {
            if self.tx.is_closed() {
                return Err(TaskwireError::ConnectionClosed);
            }
            if self.pending.load(Ordering::Acquire) < max {
                return Ok(());
            }
            if start.elapsed() > self.timeout {
                return Err(TaskwireError::BackpressureTimeout);
            }
            tokio::time::sleep(check_interval).await;
        }
    }
}

/// Spawn the writer task and return a handle for sending frames.
///
/// The task ends after writing a `Disconnect` frame (shutting the stream
/// down) or when every handle is dropped.
pub fn spawn_writer_task<W>(writer: W, config: WriterConfig) -> (WriterHandle, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let pending = Arc::new(AtomicUsize::new(0));

    let handle = WriterHandle {
        tx,
        pending: pending.clone(),
        max_pending: config.max_pending_frames,
        timeout: config.backpressure_timeout,
    };

    let task = tokio::spawn(writer_loop(rx, writer, pending));
    (handle, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::UnboundedReceiver<Vec<OutboundFrame>>,
    mut writer: W,
    pending: Arc<AtomicUsize>,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let mut batch = match rx.recv().await {
            Some(frames) => frames,
            None => {
                let _ = writer.shutdown().await;
                return Ok(());
            }
        };

        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frames) => batch.extend(frames),
                Err(_) => break,
            }
        }

        let batch_size = batch.len();
        let saw_disconnect = batch.iter().any(OutboundFrame::is_disconnect);
        let result = write_batch(&mut writer, &batch).await;
        pending.fetch_sub(batch_size, Ordering::Release);
        result?;

        if saw_disconnect {
            tracing::trace!("Disconnect written, shutting stream down");
            rx.close();
            let _ = writer.shutdown().await;
            return Ok(());
        }
    }
}

/// Write a batch of frames using scatter/gather I/O (write_vectored).
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(batch.len() * 2);
    for frame in batch {
        slices.push(IoSlice::new(&frame.header));
        if !frame.payload.is_empty() {
            slices.push(IoSlice::new(&frame.payload));
        }
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = writer.write_vectored(&slices).await?;

    while total_written < total_size {
        if total_written == 0 {
            return Err(TaskwireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        let remaining = build_remaining_slices(batch, total_written);
        let written = writer.write_vectored(&remaining).await?;
        if written == 0 {
            return Err(TaskwireError::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            )));
        }
        total_written += written;
    }

    writer.flush().await?;
    Ok(())
}

/// Build IoSlice array for remaining data after partial write.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut offset = 0;

    for frame in batch {
        let header_end = offset + HEADER_SIZE;
        if skip_bytes < header_end {
            let start = skip_bytes.saturating_sub(offset);
            slices.push(IoSlice::new(&frame.header[start..]));
        }
        offset = header_end;

        if !frame.payload.is_empty() {
            let payload_end = offset + frame.payload.len();
            if skip_bytes < payload_end {
                let start = skip_bytes.saturating_sub(offset);
                slices.push(IoSlice::new(&frame.payload[start..]));
            }
            offset = payload_end;
        }
    }

    slices
}
