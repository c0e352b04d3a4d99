//! Frame struct and encoding.
//!
//! A frame is a header plus payload. Uses `bytes::Bytes` so payloads move
//! from the socket buffer into channel queues without copying.
//!
//! # Example
//!
//! ```
//! use taskwire::protocol::{Frame, FrameBuffer};
//! use bytes::Bytes;
//!
//! let frame = Frame::channel_data(20, Bytes::from_static(b"hello"));
//! let mut buffer = FrameBuffer::new();
//! let frames = buffer.push(&frame.encode()).unwrap();
//! assert_eq!(frames, vec![frame]);
//! ```

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};

use super::wire_format::{FrameType, Header, HEADER_SIZE};

/// A complete protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame type.
    pub frame_type: FrameType,
    /// Channel number.
    pub channel: u16,
    /// Payload bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Create a new frame.
    pub fn new(frame_type: FrameType, channel: u16, payload: Bytes) -> Self {
        Self {
            frame_type,
            channel,
            payload,
        }
    }

    /// Data for a channel.
    pub fn channel_data(channel: u16, payload: Bytes) -> Self {
        Self::new(FrameType::ChannelData, channel, payload)
    }

    /// Connection-level disconnect.
    pub fn disconnect() -> Self {
        Self::new(FrameType::Disconnect, 0, Bytes::new())
    }

    /// Heartbeat carrying the sender's liveness timeout.
    pub fn heartbeat(timeout: Duration) -> Self {
        let millis = u32::try_from(timeout.as_millis()).unwrap_or(u32::MAX);
        Self::new(
            FrameType::Heartbeat,
            0,
            Bytes::copy_from_slice(&millis.to_be_bytes()),
        )
    }

    /// Diagnostic text.
    pub fn debug(text: &str) -> Self {
        Self::new(FrameType::Debug, 0, Bytes::copy_from_slice(text.as_bytes()))
    }

    /// Header describing this frame.
    #[inline]
    pub fn header(&self) -> Header {
        Header::new(self.frame_type, self.channel, self.payload.len() as u32)
    }

    /// Timeout announced by a heartbeat frame, if this is one.
    pub fn heartbeat_timeout(&self) -> Option<Duration> {
        if self.frame_type != FrameType::Heartbeat || self.payload.len() != 4 {
            return None;
        }
        let millis = u32::from_be_bytes([
            self.payload[0],
            self.payload[1],
            self.payload[2],
            self.payload[3],
        ]);
        Some(Duration::from_millis(millis as u64))
    }

    /// Total encoded size (header + payload).
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }

    /// Encode header and payload into one contiguous buffer.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.size());
        buf.put_slice(&self.header().encode());
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}
