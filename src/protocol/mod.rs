//! Protocol module - wire format, framing, and frame types.
//!
//! This module implements the binary framing shared by every connection:
//! - 7-byte header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Reserved channel numbers

mod frame;
mod frame_buffer;
mod wire_format;

pub use frame::Frame;
pub use frame_buffer::{read_frame, FrameBuffer};
pub use wire_format::{channels, FrameType, Header, DEFAULT_MAX_FRAME_SIZE, HEADER_SIZE};
