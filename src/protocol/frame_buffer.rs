//! Frame buffer for accumulating partial reads.
//!
//! Uses `bytes::BytesMut` for zero-copy buffer management.
//! Implements a state machine for handling fragmented frames:
//! - `WaitingForHeader`: Need at least 7 bytes
//! - `WaitingForPayload`: Header parsed, need N more payload bytes
//!
//! # Example
//!
//! ```ignore
//! use taskwire::protocol::FrameBuffer;
//!
//! let mut buffer = FrameBuffer::new();
//!
//! // Data arrives in chunks from socket
//! let frames = buffer.push(&chunk)?;
//! for frame in frames {
//!     println!("Got frame on channel {}", frame.channel);
//! }
//! ```

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use super::wire_format::{Header, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::{Result, TaskwireError};

/// State machine for frame parsing.
#[derive(Debug, Clone)]
enum State {
    /// Waiting for complete header (need 7 bytes).
    WaitingForHeader,
    /// Header parsed, waiting for payload bytes.
    WaitingForPayload { header: Header },
}

/// Buffer for accumulating incoming bytes and extracting complete frames.
pub struct FrameBuffer {
    /// Accumulated bytes from socket reads.
    buffer: BytesMut,
    /// Current parsing state.
    state: State,
    /// Maximum allowed payload size.
    max_frame_size: u32,
}

impl FrameBuffer {
    /// Create a new frame buffer with the default 512 KiB frame limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new frame buffer with a custom frame limit.
    pub fn with_max_frame_size(max_frame_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(64 * 1024),
            state: State::WaitingForHeader,
            max_frame_size,
        }
    }

    /// Push data into the buffer and extract all complete frames.
    ///
    /// Partial data is kept for the next push.
    ///
    /// # Errors
    ///
    /// Returns `MalformedFrame` if a header declares a payload above the
    /// limit or carries an unknown type byte. The buffer is unusable
    /// afterwards; the connection must be dropped.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.try_extract_one()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Signal end of stream.
    ///
    /// A stream that ends between frames is a clean disconnect. One that ends
    /// in the middle of a header or payload is a truncated frame.
    pub fn finish(&self) -> Result<()> {
        match &self.state {
            State::WaitingForHeader if self.buffer.is_empty() => Ok(()),
            State::WaitingForHeader => Err(TaskwireError::MalformedFrame(format!(
                "Stream ended inside a frame header ({} of {} bytes)",
                self.buffer.len(),
                HEADER_SIZE
            ))),
            State::WaitingForPayload { header } => Err(TaskwireError::MalformedFrame(format!(
                "Stream ended inside a frame payload ({} of {} bytes)",
                self.buffer.len(),
                header.payload_length
            ))),
        }
    }

    fn try_extract_one(&mut self) -> Result<Option<Frame>> {
        loop {
            match &self.state {
                State::WaitingForHeader => {
                    let header = match Header::decode(&self.buffer)? {
                        Some(header) => header,
                        None => return Ok(None),
                    };
                    header.validate(self.max_frame_size)?;
                    let _ = self.buffer.split_to(HEADER_SIZE);

                    if header.payload_length == 0 {
                        return Ok(Some(Frame::new(
                            header.frame_type,
                            header.channel,
                            Bytes::new(),
                        )));
                    }
                    self.state = State::WaitingForPayload { header };
                }
                State::WaitingForPayload { header } => {
                    let remaining = header.payload_length as usize;
                    if self.buffer.len() < remaining {
                        return Ok(None);
                    }
                    let header = *header;
                    let payload = self.buffer.split_to(remaining).freeze();
                    self.state = State::WaitingForHeader;
                    return Ok(Some(Frame::new(header.frame_type, header.channel, payload)));
                }
            }
        }
    }

    /// Get the number of buffered bytes.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[cfg(test)]
    fn state_name(&self) -> &'static str {
        match &self.state {
            State::WaitingForHeader => "WaitingForHeader",
            State::WaitingForPayload { .. } => "WaitingForPayload",
        }
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Read exactly one frame from an async reader.
///
/// Returns `Ok(None)` when the peer closed the stream before sending any byte
/// of a new frame, and `MalformedFrame` when it closed part-way through.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: u32) -> Result<Option<Frame>>
where
    R: AsyncRead + Unpin,
{
    let mut header_buf = [0u8; HEADER_SIZE];
    let mut filled = 0;
    while filled < HEADER_SIZE {
        let n = reader.read(&mut header_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(TaskwireError::MalformedFrame(format!(
                "Stream ended inside a frame header ({} of {} bytes)",
                filled, HEADER_SIZE
            )));
        }
        filled += n;
    }

    let header = Header::decode(&header_buf)?
        .ok_or_else(|| TaskwireError::MalformedFrame("Short header".to_string()))?;
    header.validate(max_frame_size)?;

    let mut payload = vec![0u8; header.payload_length as usize];
    if let Err(e) = reader.read_exact(&mut payload).await {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            return Err(TaskwireError::MalformedFrame(format!(
                "Stream ended inside a frame payload (expected {} bytes)",
                header.payload_length
            )));
        }
        return Err(e.into());
    }

    Ok(Some(Frame::new(
        header.frame_type,
        header.channel,
        Bytes::from(payload),
    )))
}
