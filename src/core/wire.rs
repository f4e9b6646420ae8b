//! # Wire Primitives
//!
//! Byte-level writer and reader used by every codec strategy.
//!
//! All multi-byte values are big-endian. Lengths use a variable-width form so
//! small collections stay compact without imposing a fixed ceiling:
//!
//! ```text
//! 0..=127        -> [0x01][i8]
//! 128..=32767    -> [0x02][i16]
//! 32768..=i32MAX -> [0x04][i32]
//! ```
//!
//! Both halves carry a [`TypeContext`] so nested polymorphic values can write
//! and resolve class ids against the connection they travel on.

use bytes::{Buf, BufMut};

use crate::core::registry::TypeContext;
use crate::error::{constants, ProtocolError, Result};

/// Tag byte announcing a one-byte length
pub const LEN_TAG_BYTE: u8 = 1;
/// Tag byte announcing a two-byte length
pub const LEN_TAG_SHORT: u8 = 2;
/// Tag byte announcing a four-byte length
pub const LEN_TAG_INT: u8 = 4;

/// Number of bytes `put_len` emits for `len`
pub fn encoded_len_size(len: usize) -> usize {
    if len <= i8::MAX as usize {
        2
    } else if len <= i16::MAX as usize {
        3
    } else {
        5
    }
}

/// Appends encoded values to a byte buffer
pub struct WireWriter<'a> {
    buf: &'a mut Vec<u8>,
    types: TypeContext<'a>,
}

impl<'a> WireWriter<'a> {
    pub fn new(buf: &'a mut Vec<u8>, types: TypeContext<'a>) -> Self {
        Self { buf, types }
    }

    /// Type context used for class ids of nested objects
    pub fn types(&self) -> TypeContext<'a> {
        self.types
    }

    /// Current write offset in the underlying buffer
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    pub fn put_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    pub fn put_i8(&mut self, v: i8) {
        self.buf.put_i8(v);
    }

    pub fn put_bool(&mut self, v: bool) {
        self.buf.put_u8(u8::from(v));
    }

    pub fn put_i16(&mut self, v: i16) {
        self.buf.put_i16(v);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.put_u16(v);
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.put_u32(v);
    }

    pub fn put_i64(&mut self, v: i64) {
        self.buf.put_i64(v);
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.put_u64(v);
    }

    pub fn put_f32(&mut self, v: f32) {
        self.buf.put_f32(v);
    }

    pub fn put_f64(&mut self, v: f64) {
        self.buf.put_f64(v);
    }

    pub fn put_slice(&mut self, bytes: &[u8]) {
        self.buf.put_slice(bytes);
    }

    /// Writes a non-negative length in the variable-width form
    pub fn put_len(&mut self, len: usize) -> Result<()> {
        if len <= i8::MAX as usize {
            self.buf.put_u8(LEN_TAG_BYTE);
            self.buf.put_i8(len as i8);
        } else if len <= i16::MAX as usize {
            self.buf.put_u8(LEN_TAG_SHORT);
            self.buf.put_i16(len as i16);
        } else if len <= i32::MAX as usize {
            self.buf.put_u8(LEN_TAG_INT);
            self.buf.put_i32(len as i32);
        } else {
            return Err(ProtocolError::Malformed(format!(
                "length {len} exceeds the i32 range"
            )));
        }
        Ok(())
    }

    /// Writes a length-prefixed UTF-8 string
    pub fn put_str(&mut self, s: &str) -> Result<()> {
        self.put_len(s.len())?;
        self.buf.put_slice(s.as_bytes());
        Ok(())
    }
}

/// Consumes encoded values from a byte slice
pub struct WireReader<'a> {
    buf: &'a [u8],
    types: TypeContext<'a>,
}

macro_rules! get_checked {
    ($name:ident, $ty:ty, $getter:ident) => {
        pub fn $name(&mut self) -> Result<$ty> {
            self.ensure(std::mem::size_of::<$ty>())?;
            Ok(self.buf.$getter())
        }
    };
}

impl<'a> WireReader<'a> {
    pub fn new(buf: &'a [u8], types: TypeContext<'a>) -> Self {
        Self { buf, types }
    }

    /// Type context used to resolve class ids of nested objects
    pub fn types(&self) -> TypeContext<'a> {
        self.types
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, needed: usize) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(ProtocolError::BufferUnderflow {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    get_checked!(get_u8, u8, get_u8);
    get_checked!(get_i8, i8, get_i8);
    get_checked!(get_i16, i16, get_i16);
    get_checked!(get_u16, u16, get_u16);
    get_checked!(get_i32, i32, get_i32);
    get_checked!(get_u32, u32, get_u32);
    get_checked!(get_i64, i64, get_i64);
    get_checked!(get_u64, u64, get_u64);
    get_checked!(get_f32, f32, get_f32);
    get_checked!(get_f64, f64, get_f64);

    pub fn get_bool(&mut self) -> Result<bool> {
        match self.get_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(ProtocolError::Malformed(format!("invalid bool byte {other}"))),
        }
    }

    /// Borrows the next `len` bytes without copying
    pub fn get_slice(&mut self, len: usize) -> Result<&'a [u8]> {
        self.ensure(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Reads a length written by [`WireWriter::put_len`]
    pub fn get_len(&mut self) -> Result<usize> {
        let value = match self.get_u8()? {
            LEN_TAG_BYTE => i32::from(self.get_i8()?),
            LEN_TAG_SHORT => i32::from(self.get_i16()?),
            LEN_TAG_INT => self.get_i32()?,
            tag => {
                return Err(ProtocolError::Malformed(format!(
                    "{}: {tag}",
                    constants::ERR_INVALID_LENGTH_TAG
                )))
            }
        };
        usize::try_from(value).map_err(|_| {
            ProtocolError::Malformed(format!("{}: {value}", constants::ERR_NEGATIVE_LENGTH))
        })
    }

    /// Reads a length and rejects it when it cannot possibly fit in the rest of
    /// the buffer at `min_item_size` bytes per item
    pub fn get_bounded_len(&mut self, min_item_size: usize) -> Result<usize> {
        let len = self.get_len()?;
        let needed = len.saturating_mul(min_item_size);
        if needed > self.remaining() {
            return Err(ProtocolError::BufferUnderflow {
                needed,
                remaining: self.remaining(),
            });
        }
        Ok(len)
    }

    pub fn get_str(&mut self) -> Result<&'a str> {
        let len = self.get_len()?;
        let bytes = self.get_slice(len)?;
        std::str::from_utf8(bytes)
            .map_err(|_| ProtocolError::Malformed(constants::ERR_INVALID_UTF8.to_string()))
    }
}
