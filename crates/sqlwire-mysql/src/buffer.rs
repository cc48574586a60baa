//! Growable byte buffer with a read cursor.
//!
//! `Buffer` is used on both sides of the wire: decoders consume fixed-width
//! little-endian integers, length-encoded integers and strings from the
//! unread region, and encoders append the same shapes at the end. Reading
//! past the end never moves the cursor and yields [`DecodeError::Underflow`],
//! which callers treat as "wait for more bytes".

#![allow(clippy::cast_possible_truncation)]

use std::fmt;

use sqlwire_core::Error;

/// Marker byte for a NULL length-encoded value.
pub const LENENC_NULL: u8 = 0xFB;

/// Failure while decoding bytes from a [`Buffer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough bytes are buffered yet.
    Underflow { needed: usize, available: usize },
    /// The bytes can never form a valid value.
    Malformed(String),
}

impl DecodeError {
    pub fn malformed(msg: impl Into<String>) -> Self {
        DecodeError::Malformed(msg.into())
    }

    pub fn is_underflow(&self) -> bool {
        matches!(self, DecodeError::Underflow { .. })
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::Underflow { needed, available } => write!(
                f,
                "buffer underflow: needed {} bytes, {} available",
                needed, available
            ),
            DecodeError::Malformed(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for DecodeError {}

impl From<DecodeError> for Error {
    fn from(err: DecodeError) -> Self {
        Error::protocol(err.to_string())
    }
}

pub type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// A byte buffer with a consumption offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    data: Vec<u8>,
    pos: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: Vec::with_capacity(capacity),
            pos: 0,
        }
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data, pos: 0 }
    }

    /// Number of unread bytes.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    /// Move the cursor back to a position previously returned by [`Buffer::position`].
    pub fn rewind(&mut self, pos: usize) {
        self.pos = pos.min(self.data.len());
    }

    /// The unread bytes.
    pub fn as_slice(&self) -> &[u8] {
        &self.data[self.pos..]
    }

    /// Every byte written so far, including consumed ones.
    pub fn written(&self) -> &[u8] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }

    /// Consume the buffer, keeping only the unread bytes.
    pub fn into_remaining(mut self) -> Vec<u8> {
        self.compact();
        self.data
    }

    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn peek_at(&self, offset: usize) -> Option<u8> {
        self.data.get(self.pos + offset).copied()
    }

    fn ensure(&self, needed: usize) -> DecodeResult<()> {
        let available = self.remaining();
        if available < needed {
            return Err(DecodeError::Underflow { needed, available });
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> DecodeResult<u8> {
        self.ensure(1)?;
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub fn read_u16(&mut self) -> DecodeResult<u16> {
        let bytes = self.read(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u24(&mut self) -> DecodeResult<u32> {
        let bytes = self.read(3)?;
        Ok(u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16))
    }

    pub fn read_u32(&mut self) -> DecodeResult<u32> {
        let bytes = self.read(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&mut self) -> DecodeResult<u64> {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(self.read(8)?);
        Ok(u64::from_le_bytes(raw))
    }

    /// Read a length-encoded integer.
    ///
    /// Returns `None` for the NULL marker (0xFB). The 8-byte form covers the
    /// full unsigned 64-bit range.
    pub fn read_lenenc_int(&mut self) -> DecodeResult<Option<u64>> {
        let start = self.pos;
        let first = self.read_u8()?;
        let value = match first {
            0x00..=0xFA => Ok(Some(u64::from(first))),
            LENENC_NULL => Ok(None),
            0xFC => self.read_u16().map(|v| Some(u64::from(v))),
            0xFD => self.read_u24().map(|v| Some(u64::from(v))),
            0xFE => self.read_u64().map(Some),
            0xFF => Err(DecodeError::malformed(
                "0xFF is not a valid length-encoded integer prefix",
            )),
        };
        if value.is_err() {
            self.pos = start;
        }
        value
    }

    /// Read a length-encoded byte string. `None` means SQL NULL.
    pub fn read_lenenc_bytes(&mut self) -> DecodeResult<Option<&[u8]>> {
        let start = self.pos;
        let Some(len) = self.read_lenenc_int()? else {
            return Ok(None);
        };
        let len = usize::try_from(len)
            .map_err(|_| DecodeError::malformed("length-encoded string too large"))?;
        if let Err(e) = self.ensure(len) {
            self.pos = start;
            return Err(e);
        }
        Ok(Some(self.read(len)?))
    }

    /// Read a length-encoded string, replacing invalid UTF-8.
    pub fn read_lenenc_string(&mut self) -> DecodeResult<Option<String>> {
        Ok(self
            .read_lenenc_bytes()?
            .map(|b| String::from_utf8_lossy(b).into_owned()))
    }

    /// Read the bytes before the next NUL and advance past the NUL.
    pub fn read_null_terminated(&mut self) -> DecodeResult<&[u8]> {
        let unread = &self.data[self.pos..];
        let Some(nul) = unread.iter().position(|&b| b == 0) else {
            return Err(DecodeError::malformed(
                "missing NUL terminator in null-terminated string",
            ));
        };
        let start = self.pos;
        self.pos += nul + 1;
        Ok(&self.data[start..start + nul])
    }

    pub fn read_null_terminated_string(&mut self) -> DecodeResult<String> {
        self.read_null_terminated()
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read exactly `n` bytes.
    pub fn read(&mut self, n: usize) -> DecodeResult<&[u8]> {
        self.ensure(n)?;
        let start = self.pos;
        self.pos += n;
        Ok(&self.data[start..self.pos])
    }

    pub fn read_string(&mut self, n: usize) -> DecodeResult<String> {
        self.read(n).map(|b| String::from_utf8_lossy(b).into_owned())
    }

    /// Read every unread byte.
    pub fn read_rest(&mut self) -> &[u8] {
        let start = self.pos;
        self.pos = self.data.len();
        &self.data[start..]
    }

    pub fn skip(&mut self, n: usize) -> DecodeResult<()> {
        self.ensure(n)?;
        self.pos += n;
        Ok(())
    }

    /// Split the next `n` unread bytes off into their own buffer.
    pub fn slice(&mut self, n: usize) -> DecodeResult<Buffer> {
        self.read(n).map(|b| Buffer::from_vec(b.to_vec()))
    }

    /// Put bytes back in front of the unread region.
    pub fn prepend(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        if self.pos >= bytes.len() && self.data[self.pos - bytes.len()..self.pos] == *bytes {
            self.pos -= bytes.len();
            return;
        }
        let mut data = Vec::with_capacity(bytes.len() + self.remaining());
        data.extend_from_slice(bytes);
        data.extend_from_slice(&self.data[self.pos..]);
        self.data = data;
        self.pos = 0;
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn clear(&mut self) {
        self.data.clear();
        self.pos = 0;
    }

    /// Drop consumed bytes.
    pub fn compact(&mut self) {
        if self.pos > 0 {
            self.data.drain(..self.pos);
            self.pos = 0;
        }
    }

    pub fn put_u8(&mut self, value: u8) {
        self.data.push(value);
    }

    pub fn put_u16(&mut self, value: u16) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u24(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes()[..3]);
    }

    pub fn put_u32(&mut self, value: u32) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    pub fn put_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a length-encoded integer using the shortest prefix.
    pub fn put_lenenc_int(&mut self, value: u64) {
        if value <= 250 {
            self.put_u8(value as u8);
        } else if value <= 0xFFFF {
            self.put_u8(0xFC);
            self.put_u16(value as u16);
        } else if value <= 0xFF_FFFF {
            self.put_u8(0xFD);
            self.put_u24(value as u32);
        } else {
            self.put_u8(0xFE);
            self.put_u64(value);
        }
    }

    pub fn put_lenenc_bytes(&mut self, bytes: &[u8]) {
        self.put_lenenc_int(bytes.len() as u64);
        self.data.extend_from_slice(bytes);
    }

    pub fn put_lenenc_str(&mut self, s: &str) {
        self.put_lenenc_bytes(s.as_bytes());
    }

    pub fn put_null_terminated(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
        self.data.push(0);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn put_zeros(&mut self, count: usize) {
        self.data.resize(self.data.len() + count, 0);
    }
}

/// Encoded size of a length-encoded integer.
pub fn lenenc_int_len(value: u64) -> usize {
    match value {
        0..=250 => 1,
        251..=0xFFFF => 3,
        0x1_0000..=0xFF_FFFF => 4,
        _ => 9,
    }
}
