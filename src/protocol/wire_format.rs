//! Wire format encoding and decoding.
//!
//! Implements the 7-byte frame header:
//! ```text
//! ┌──────┬──────────┬──────────┐
//! │ Type │ Channel  │ Length   │
//! │ 1 B  │ 2 bytes  │ 4 bytes  │
//! │      │ uint16 BE│ uint32 BE│
//! └──────┴──────────┴──────────┘
//! ```
//!
//! All multi-byte integers are Big Endian.

use crate::error::{Result, TaskwireError};

/// Header size in bytes (fixed, exactly 7).
pub const HEADER_SIZE: usize = 7;

/// Default maximum payload size per frame (512 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 512 * 1024;

/// Well-known channel numbers. Stable across versions.
pub mod channels {
    /// Application to mediator (runner selection).
    pub const APPLICATION_MEDIATOR: u16 = 10;
    /// Runner to mediator (status reports).
    pub const RUNNER_MEDIATOR: u16 = 11;
    /// Task execution protocol.
    pub const TASK: u16 = 20;
    /// Assembly / resource resolution.
    pub const ASSEMBLY: u16 = 21;
    /// File transfer.
    pub const FILE: u16 = 22;
}

/// Frame type byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Payload bytes for a channel.
    ChannelData = 1,
    /// Peer is closing the connection.
    Disconnect = 2,
    /// Diagnostic text, never routed to channels.
    Debug = 3,
    /// Liveness signal; payload is the sender's timeout in ms.
    Heartbeat = 4,
}

impl FrameType {
    /// Parse a type byte.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::ChannelData),
            2 => Some(Self::Disconnect),
            3 => Some(Self::Debug),
            4 => Some(Self::Heartbeat),
            _ => None,
        }
    }
}

/// Decoded header from wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// Frame type.
    pub frame_type: FrameType,
    /// Channel number (0 for connection-level frames).
    pub channel: u16,
    /// Payload length in bytes.
    pub payload_length: u32,
}

impl Header {
    /// Create a new header.
    pub fn new(frame_type: FrameType, channel: u16, payload_length: u32) -> Self {
        Self {
            frame_type,
            channel,
            payload_length,
        }
    }

    /// Encode header to bytes (Big Endian).
    ///
    /// # Example
    ///
    /// ```
    /// use taskwire::protocol::{FrameType, Header};
    ///
    /// let header = Header::new(FrameType::ChannelData, 20, 100);
    /// let bytes = header.encode();
    /// assert_eq!(bytes, [1, 0, 20, 0, 0, 0, 100]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0] = self.frame_type as u8;
        buf[1..3].copy_from_slice(&self.channel.to_be_bytes());
        buf[3..7].copy_from_slice(&self.payload_length.to_be_bytes());
        buf
    }

    /// Decode header from bytes (Big Endian).
    ///
    /// Returns `Ok(None)` if the buffer is too short and a `MalformedFrame`
    /// error for an unknown type byte.
    pub fn decode(buf: &[u8]) -> Result<Option<Self>> {
        if buf.len() < HEADER_SIZE {
            return Ok(None);
        }
        let frame_type = FrameType::from_u8(buf[0]).ok_or_else(|| {
            TaskwireError::MalformedFrame(format!("Unknown frame type {:#04x}", buf[0]))
        })?;
        Ok(Some(Self {
            frame_type,
            channel: u16::from_be_bytes([buf[1], buf[2]]),
            payload_length: u32::from_be_bytes([buf[3], buf[4], buf[5], buf[6]]),
        }))
    }

    /// Reject payloads larger than the configured maximum.
    pub fn validate(&self, max_frame_size: u32) -> Result<()> {
        if self.payload_length > max_frame_size {
            return Err(TaskwireError::MalformedFrame(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_frame_size
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_encode_decode_roundtrip() {
        let original = Header::new(FrameType::Heartbeat, 0, 4);
        let decoded = Header::decode(&original.encode()).unwrap().unwrap();
        assert_eq!(original, decoded);
    }

    #[test]
    fn test_header_big_endian_byte_order() {
        let header = Header::new(FrameType::Debug, 0x0102, 0x03040506);
        let bytes = header.encode();

        assert_eq!(bytes[0], 3);
        assert_eq!(&bytes[1..3], &[0x01, 0x02]);
        assert_eq!(&bytes[3..7], &[0x03, 0x04, 0x05, 0x06]);
    }

    #[test]
    fn test_decode_too_short_buffer() {
        assert!(Header::decode(&[1, 0, 20]).unwrap().is_none());
    }

    #[test]
    fn test_decode_unknown_type_rejected() {
        let result = Header::decode(&[9, 0, 1, 0, 0, 0, 0]);
        assert!(matches!(result, Err(TaskwireError::MalformedFrame(_))));
    }

    #[test]
    fn test_validate_payload_too_large() {
        let header = Header::new(FrameType::ChannelData, 20, 1_000_000);
        let err = header.validate(100).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
        assert!(header.validate(DEFAULT_MAX_FRAME_SIZE * 2).is_ok());
    }

    #[test]
    fn test_reserved_channel_numbers() {
        assert_eq!(channels::APPLICATION_MEDIATOR, 10);
        assert_eq!(channels::RUNNER_MEDIATOR, 11);
        assert_eq!(channels::TASK, 20);
        assert_eq!(channels::ASSEMBLY, 21);
        assert_eq!(channels::FILE, 22);
    }
}
