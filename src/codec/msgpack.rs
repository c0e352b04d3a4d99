//! MsgPack codec using `rmp-serde`.
//!
//! Structs are encoded with `to_vec_named` (struct-as-map), so a work unit
//! or result stays readable by peers that do not share the Rust field order.
//!
//! # Example
//!
//! ```
//! use taskwire::codec::MsgPackCodec;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Args {
//!     a: i64,
//!     b: i64,
//! }
//!
//! let encoded = MsgPackCodec::encode(&Args { a: 2, b: 3 }).unwrap();
//! let decoded: Args = MsgPackCodec::decode(&encoded).unwrap();
//! assert_eq!(decoded, Args { a: 2, b: 3 });
//! ```

use bytes::Bytes;

use crate::error::Result;

/// MessagePack codec for structured data.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Encode a value to MsgPack bytes.
    #[inline]
    pub fn encode<T: serde::Serialize>(value: &T) -> Result<Bytes> {
        Ok(Bytes::from(rmp_serde::to_vec_named(value)?))
    }

    /// Decode MsgPack bytes to a value.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
