//! XDR encoding and ONC RPC framing for the guest-nfsd services.
//!
//! Everything on the wire is a sequence of big-endian 32-bit units:
//!
//! ```text
//! ┌────────────┬────────────┬─────────────────────────────┐
//! │ u32 / i32  │ bool (u32) │ opaque: len(4) data pad(0-3) │
//! └────────────┴────────────┴─────────────────────────────┘
//! ```
//!
//! - Fixed-size opaque blocks carry no length word but are still padded to 4.
//! - Strings are opaque blocks holding (ideally) UTF-8 text.
//!
//! The [`rpc`] module layers RFC 5531 call/reply headers and TCP record
//! marking on top of the primitive codec in this file.

use byteorder::{BigEndian, ByteOrder};
use std::fmt;

pub mod rpc;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

/// Errors raised while decoding XDR data or RPC framing.
#[derive(Debug)]
pub enum XdrError {
    /// The buffer ended before the requested item.
    Truncated { needed: usize, remaining: usize },
    /// A length prefix exceeded the limit for that item.
    TooLong { len: usize, max: usize },
    /// A boolean that was neither 0 nor 1.
    InvalidBool(u32),
    /// A structurally invalid message (wrong message type, bad header).
    InvalidMessage(String),
    /// An I/O error occurred while reading or writing a record.
    Io(std::io::Error),
}

impl fmt::Display for XdrError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            XdrError::Truncated { needed, remaining } => write!(
                f,
                "Truncated XDR data: needed {} bytes, {} remaining",
                needed, remaining
            ),
            XdrError::TooLong { len, max } => {
                write!(f, "XDR item too long: {} bytes (max {})", len, max)
            }
            XdrError::InvalidBool(v) => write!(f, "Invalid XDR boolean: {}", v),
            XdrError::InvalidMessage(msg) => write!(f, "Invalid message: {}", msg),
            XdrError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for XdrError {}

impl From<std::io::Error> for XdrError {
    fn from(e: std::io::Error) -> Self {
        XdrError::Io(e)
    }
}

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Size of one XDR unit.
pub const UNIT: usize = 4;

/// Number of zero bytes needed to pad `len` to a whole XDR unit.
pub fn padding(len: usize) -> usize {
    (UNIT - len % UNIT) % UNIT
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Cursor over an XDR-encoded buffer.
#[derive(Debug, Clone)]
pub struct XdrReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> XdrReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far.
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Unconsumed tail of the buffer.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], XdrError> {
        if self.remaining() < n {
            return Err(XdrError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u32(&mut self) -> Result<u32, XdrError> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub fn read_i32(&mut self) -> Result<i32, XdrError> {
        Ok(BigEndian::read_i32(self.take(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64, XdrError> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    pub fn read_bool(&mut self) -> Result<bool, XdrError> {
        match self.read_u32()? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(XdrError::InvalidBool(v)),
        }
    }

    /// Read an opaque block of known size, consuming its padding.
    pub fn read_fixed_opaque(&mut self, len: usize) -> Result<&'a [u8], XdrError> {
        let data = self.take(len)?;
        self.take(padding(len))?;
        Ok(data)
    }

    /// Read a length-prefixed opaque block of at most `max` bytes.
    pub fn read_opaque(&mut self, max: usize) -> Result<&'a [u8], XdrError> {
        let len = self.read_u32()? as usize;
        if len > max {
            return Err(XdrError::TooLong { len, max });
        }
        self.read_fixed_opaque(len)
    }

    /// Read a length-prefixed string. Invalid UTF-8 is replaced, not rejected.
    pub fn read_string(&mut self, max: usize) -> Result<String, XdrError> {
        let raw = self.read_opaque(max)?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Growable XDR output buffer.
#[derive(Debug, Default, Clone)]
pub struct XdrWriter {
    buf: Vec<u8>,
}

impl XdrWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u32(&mut self, v: u32) {
        let mut b = [0u8; 4];
        BigEndian::write_u32(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    pub fn write_i32(&mut self, v: i32) {
        let mut b = [0u8; 4];
        BigEndian::write_i32(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    pub fn write_u64(&mut self, v: u64) {
        let mut b = [0u8; 8];
        BigEndian::write_u64(&mut b, v);
        self.buf.extend_from_slice(&b);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u32(v as u32);
    }

    /// Write an opaque block without a length word, padded to a unit.
    pub fn write_fixed_opaque(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
        self.buf.extend(std::iter::repeat(0u8).take(padding(data.len())));
    }

    pub fn write_opaque(&mut self, data: &[u8]) {
        self.write_u32(data.len() as u32);
        self.write_fixed_opaque(data);
    }

    pub fn write_string(&mut self, s: &str) {
        self.write_opaque(s.as_bytes());
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding() {
        assert_eq!(padding(0), 0);
        assert_eq!(padding(1), 3);
        assert_eq!(padding(4), 0);
        assert_eq!(padding(5), 3);
        assert_eq!(padding(7), 1);
    }

    #[test]
    fn test_integers_are_big_endian() {
        let mut w = XdrWriter::new();
        w.write_u32(0x0102_0304);
        w.write_i32(-2);
        w.write_u64(0x1122_3344_5566_7788);
        assert_eq!(
            w.as_bytes(),
            &[
                1, 2, 3, 4, 0xff, 0xff, 0xff, 0xfe, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77,
                0x88
            ]
        );

        let mut r = XdrReader::new(w.as_bytes());
        assert_eq!(r.read_u32().unwrap(), 0x0102_0304);
        assert_eq!(r.read_i32().unwrap(), -2);
        assert_eq!(r.read_u64().unwrap(), 0x1122_3344_5566_7788);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_string_is_padded() {
        let mut w = XdrWriter::new();
        w.write_string("hello");
        assert_eq!(w.len(), 4 + 8);
        assert_eq!(&w.as_bytes()[4..9], b"hello");
        assert_eq!(&w.as_bytes()[9..], &[0, 0, 0]);

        let mut r = XdrReader::new(w.as_bytes());
        assert_eq!(r.read_string(255).unwrap(), "hello");
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_opaque_limit_enforced() {
        let mut w = XdrWriter::new();
        w.write_opaque(&[7u8; 10]);
        let mut r = XdrReader::new(w.as_bytes());
        match r.read_opaque(8) {
            Err(XdrError::TooLong { len: 10, max: 8 }) => {}
            other => panic!("expected TooLong, got {:?}", other),
        }
    }

    #[test]
    fn test_truncated_read() {
        let mut r = XdrReader::new(&[0, 0, 1]);
        match r.read_u32() {
            Err(XdrError::Truncated {
                needed: 4,
                remaining: 3,
            }) => {}
            other => panic!("expected Truncated, got {:?}", other),
        }
    }

    #[test]
    fn test_invalid_bool() {
        let mut r = XdrReader::new(&[0, 0, 0, 2]);
        assert!(matches!(r.read_bool(), Err(XdrError::InvalidBool(2))));
    }
}
