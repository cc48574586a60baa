//! Compressed packet wrapping (`CLIENT_COMPRESS`).
//!
//! Each compressed frame has a 7-byte header:
//! - 3 bytes: length of the (possibly compressed) body
//! - 1 byte: compression sequence number
//! - 3 bytes: uncompressed body length, or 0 when the body is stored raw
//!
//! The body carries ordinary framed packets.

#![allow(clippy::cast_possible_truncation)]

use std::io::Write;

use flate2::Compression;
use flate2::write::{ZlibDecoder, ZlibEncoder};
use sqlwire_core::{Error, Result};

use super::MAX_PACKET_SIZE;
use crate::buffer::Buffer;

/// Bodies shorter than this are sent uncompressed.
pub const MIN_COMPRESS_LENGTH: usize = 50;

const HEADER_SIZE: usize = 7;

/// Wraps outbound packets in compressed frames and unwraps inbound ones.
pub struct CompressedFramer {
    encoder: ZlibEncoder<Vec<u8>>,
    decoder: ZlibDecoder<Vec<u8>>,
    inbound: Buffer,
    sequence: u8,
}

impl std::fmt::Debug for CompressedFramer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedFramer")
            .field("buffered", &self.inbound.remaining())
            .field("sequence", &self.sequence)
            .finish_non_exhaustive()
    }
}

impl Default for CompressedFramer {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressedFramer {
    pub fn new() -> Self {
        Self {
            encoder: ZlibEncoder::new(Vec::new(), Compression::default()),
            decoder: ZlibDecoder::new(Vec::new()),
            inbound: Buffer::new(),
            sequence: u8::MAX,
        }
    }

    /// Restart the compression sequence so the next frame uses 0.
    pub fn reset_sequence(&mut self) {
        self.sequence = u8::MAX;
    }

    pub fn sequence(&self) -> u8 {
        self.sequence
    }

    /// Wrap already-framed packets into compressed frames appended to `out`.
    pub fn wrap(&mut self, framed: &[u8], out: &mut Vec<u8>) -> Result<()> {
        for chunk in framed.chunks(MAX_PACKET_SIZE) {
            self.sequence = self.sequence.wrapping_add(1);
            if chunk.len() < MIN_COMPRESS_LENGTH {
                write_header(out, chunk.len(), self.sequence, 0);
                out.extend_from_slice(chunk);
                continue;
            }
            self.encoder.write_all(chunk)?;
            let compressed = self.encoder.reset(Vec::new())?;
            if compressed.len() >= chunk.len() {
                write_header(out, chunk.len(), self.sequence, 0);
                out.extend_from_slice(chunk);
            } else {
                write_header(out, compressed.len(), self.sequence, chunk.len());
                out.extend_from_slice(&compressed);
            }
        }
        tracing::trace!(
            framed = framed.len(),
            wire = out.len(),
            sequence = self.sequence,
            "wrapped compressed frames"
        );
        Ok(())
    }

    /// Buffer raw bytes received from the transport.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.inbound.append(bytes);
    }

    /// Decode every complete frame buffered so far into `out`.
    ///
    /// A partial trailing frame stays buffered. A body whose inflated size
    /// differs from its header is a fatal framing error.
    pub fn unwrap_into(&mut self, out: &mut Buffer) -> Result<()> {
        while let Some(frame) = self.next_frame()? {
            out.append(&frame);
        }
        self.inbound.compact();
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Vec<u8>>> {
        let header = self.inbound.as_slice();
        if header.len() < HEADER_SIZE {
            return Ok(None);
        }
        let body_len = read_u24(&header[0..3]);
        let sequence = header[3];
        let uncompressed_len = read_u24(&header[4..7]);
        if header.len() < HEADER_SIZE + body_len {
            return Ok(None);
        }

        if sequence != self.sequence.wrapping_add(1) {
            tracing::warn!(
                expected = self.sequence.wrapping_add(1),
                received = sequence,
                "compressed sequence mismatch"
            );
        }
        self.sequence = sequence;

        self.inbound.skip(HEADER_SIZE)?;
        let body = self.inbound.read(body_len)?;
        if uncompressed_len == 0 {
            return Ok(Some(body.to_vec()));
        }

        self.decoder.write_all(body)?;
        let inflated = self.decoder.reset(Vec::new())?;
        if inflated.len() != uncompressed_len {
            return Err(Error::protocol(format!(
                "compressed frame inflated to {} bytes, header declared {}",
                inflated.len(),
                uncompressed_len
            )));
        }
        Ok(Some(inflated))
    }
}

fn write_header(out: &mut Vec<u8>, body_len: usize, sequence: u8, uncompressed_len: usize) {
    out.extend_from_slice(&(body_len as u32).to_le_bytes()[..3]);
    out.push(sequence);
    out.extend_from_slice(&(uncompressed_len as u32).to_le_bytes()[..3]);
}

fn read_u24(bytes: &[u8]) -> usize {
    usize::from(bytes[0]) | (usize::from(bytes[1]) << 8) | (usize::from(bytes[2]) << 16)
}
