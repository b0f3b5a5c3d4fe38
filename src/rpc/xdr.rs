//! Minimal XDR (RFC 4506) primitives.
//!
//! Only the handful of types the built-in programs and the message header
//! need: 32/64-bit integers, variable-length opaque data and strings.

use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Errors from decoding XDR data.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum XdrError {
    #[error("unexpected end of data: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("string is not valid UTF-8")]
    InvalidUtf8,

    #[error("length {len} exceeds limit {limit}")]
    TooLong { len: usize, limit: usize },
}

/// Reads XDR values from a byte buffer.
pub struct XdrReader {
    buf: Bytes,
}

impl XdrReader {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    fn ensure(&self, needed: usize) -> Result<(), XdrError> {
        if self.buf.remaining() < needed {
            return Err(XdrError::Truncated {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    pub fn get_u32(&mut self) -> Result<u32, XdrError> {
        self.ensure(4)?;
        Ok(self.buf.get_u32())
    }

    pub fn get_i32(&mut self) -> Result<i32, XdrError> {
        self.ensure(4)?;
        Ok(self.buf.get_i32())
    }

    pub fn get_u64(&mut self) -> Result<u64, XdrError> {
        self.ensure(8)?;
        Ok(self.buf.get_u64())
    }

    /// Variable-length opaque data, with an upper bound on its length.
    pub fn get_opaque(&mut self, limit: usize) -> Result<Bytes, XdrError> {
        let len = self.get_u32()? as usize;
        if len > limit {
            return Err(XdrError::TooLong { len, limit });
        }
        let padded = len + pad(len);
        self.ensure(padded)?;
        let data = self.buf.split_to(len);
        self.buf.advance(pad(len));
        Ok(data)
    }

    pub fn get_string(&mut self, limit: usize) -> Result<String, XdrError> {
        let raw = self.get_opaque(limit)?;
        String::from_utf8(raw.to_vec()).map_err(|_| XdrError::InvalidUtf8)
    }

    /// Take everything left, e.g. the procedure arguments after a call header.
    pub fn into_rest(self) -> Bytes {
        self.buf
    }
}

/// Writes XDR values into a growable buffer.
#[derive(Default)]
pub struct XdrWriter {
    buf: BytesMut,
}

impl XdrWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32(v);
        self
    }

    pub fn put_i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32(v);
        self
    }

    pub fn put_u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64(v);
        self
    }

    pub fn put_opaque(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_u32(data.len() as u32);
        self.buf.put_slice(data);
        self.buf.put_bytes(0, pad(data.len()));
        self
    }

    pub fn put_string(&mut self, s: &str) -> &mut Self {
        self.put_opaque(s.as_bytes())
    }

    /// Append already-encoded bytes verbatim.
    pub fn put_raw(&mut self, data: &[u8]) -> &mut Self {
        self.buf.put_slice(data);
        self
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

fn pad(len: usize) -> usize {
    (4 - len % 4) % 4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_string_is_padded_to_four_bytes() {
        let mut w = XdrWriter::new();
        w.put_string("brick");
        let encoded = w.finish();

        // 4 length + 5 data + 3 padding
        assert_eq!(encoded.len(), 12);
        assert_eq!(&encoded[..4], &[0, 0, 0, 5]);
        assert_eq!(&encoded[9..], &[0, 0, 0]);

        let mut r = XdrReader::new(encoded);
        assert_eq!(r.get_string(64).unwrap(), "brick");
        assert!(r.into_rest().is_empty());
    }

    #[test]
    fn test_truncated_input() {
        let mut r = XdrReader::new(Bytes::from_static(&[0, 0, 1]));
        assert_eq!(
            r.get_u32(),
            Err(XdrError::Truncated {
                needed: 4,
                remaining: 3
            })
        );
    }

    #[test]
    fn test_opaque_limit_enforced() {
        let mut w = XdrWriter::new();
        w.put_opaque(&[1; 32]);
        let mut r = XdrReader::new(w.finish());
        assert_eq!(
            r.get_opaque(16),
            Err(XdrError::TooLong { len: 32, limit: 16 })
        );
    }
}
