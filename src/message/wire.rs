//! Primitive field encoding for message bodies.
//!
//! - integers: big-endian
//! - strings: `[len:u32][utf-8]`
//! - byte blobs: `[len:u32][bytes]`
//! - optional values: `[present:u8]` followed by the value when 1
//! - arrays: `[count:u32]` followed by the elements

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, TaskwireError};

pub(crate) fn put_str(buf: &mut BytesMut, value: &str) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value.as_bytes());
}

pub(crate) fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    buf.put_u32(value.len() as u32);
    buf.put_slice(value);
}

pub(crate) fn put_opt_str(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(s) => {
            buf.put_u8(1);
            put_str(buf, s);
        }
        None => buf.put_u8(0),
    }
}

pub(crate) fn put_str_list(buf: &mut BytesMut, values: &[String]) {
    buf.put_u32(values.len() as u32);
    for value in values {
        put_str(buf, value);
    }
}

/// Cursor over a message body. Every read is bounds-checked.
pub(crate) struct BodyReader {
    body: Bytes,
}

impl BodyReader {
    pub(crate) fn new(body: Bytes) -> Self {
        Self { body }
    }

    fn need(&self, n: usize, what: &str) -> Result<()> {
        if self.body.remaining() < n {
            return Err(TaskwireError::Protocol(format!(
                "Message body too short for {} (need {}, have {})",
                what,
                n,
                self.body.remaining()
            )));
        }
        Ok(())
    }

    pub(crate) fn u8(&mut self) -> Result<u8> {
        self.need(1, "u8")?;
        Ok(self.body.get_u8())
    }

    pub(crate) fn u32(&mut self) -> Result<u32> {
        self.need(4, "u32")?;
        Ok(self.body.get_u32())
    }

    pub(crate) fn bytes(&mut self) -> Result<Bytes> {
        let len = self.u32()? as usize;
        self.need(len, "byte blob")?;
        Ok(self.body.split_to(len))
    }

    pub(crate) fn string(&mut self) -> Result<String> {
        let raw = self.bytes()?;
        String::from_utf8(raw.to_vec())
            .map_err(|e| TaskwireError::Protocol(format!("Invalid UTF-8 string: {}", e)))
    }

    pub(crate) fn opt_string(&mut self) -> Result<Option<String>> {
        match self.u8()? {
            0 => Ok(None),
            1 => Ok(Some(self.string()?)),
            other => Err(TaskwireError::Protocol(format!(
                "Invalid option marker {}",
                other
            ))),
        }
    }

    pub(crate) fn string_list(&mut self) -> Result<Vec<String>> {
        let count = self.u32()? as usize;
        // Each element needs at least its 4-byte length prefix.
        self.need(count.saturating_mul(4), "string list")?;
        (0..count).map(|_| self.string()).collect()
    }

    /// Fail if unread bytes remain.
    pub(crate) fn finish(self) -> Result<()> {
        if self.body.has_remaining() {
            return Err(TaskwireError::Protocol(format!(
                "{} trailing bytes in message body",
                self.body.remaining()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_layout() {
        let mut buf = BytesMut::new();
        put_str(&mut buf, "hé");
        assert_eq!(&buf[..], &[0, 0, 0, 3, b'h', 0xC3, 0xA9]);
    }

    #[test]
    fn test_mixed_fields_read_back() {
        let mut buf = BytesMut::new();
        put_opt_str(&mut buf, None);
        put_opt_str(&mut buf, Some("label"));
        put_str_list(&mut buf, &["a".to_string(), "bc".to_string()]);
        put_bytes(&mut buf, &[1, 2, 3]);

        let mut reader = BodyReader::new(buf.freeze());
        assert_eq!(reader.opt_string().unwrap(), None);
        assert_eq!(reader.opt_string().unwrap().as_deref(), Some("label"));
        assert_eq!(reader.string_list().unwrap(), vec!["a", "bc"]);
        assert_eq!(&reader.bytes().unwrap()[..], &[1, 2, 3]);
        assert!(reader.finish().is_ok());
    }

    #[test]
    fn test_short_body_is_protocol_error() {
        let mut reader = BodyReader::new(Bytes::from_static(&[0, 0, 0, 9, b'x']));
        assert!(matches!(reader.string(), Err(TaskwireError::Protocol(_))));
    }

    #[test]
    fn test_huge_list_count_rejected_without_allocation() {
        let mut reader = BodyReader::new(Bytes::from_static(&[0xFF, 0xFF, 0xFF, 0xFF]));
        assert!(matches!(
            reader.string_list(),
            Err(TaskwireError::Protocol(_))
        ));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let reader = BodyReader::new(Bytes::from_static(&[1]));
        assert!(reader.finish().is_err());
    }
}
