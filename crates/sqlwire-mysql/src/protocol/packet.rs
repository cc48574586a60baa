//! Packet headers and payload framing.

#![allow(clippy::cast_possible_truncation)]

use super::MAX_PACKET_SIZE;

/// A MySQL packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length (3 bytes, max 16MB - 1)
    pub payload_length: u32,
    /// Sequence number (wraps at 255)
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Total header size in bytes.
    pub const SIZE: usize = 4;

    /// Parse a header from the front of `bytes`, if four bytes are present.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let raw: &[u8; 4] = bytes.get(..Self::SIZE)?.try_into().ok()?;
        Some(Self::from_bytes(raw))
    }

    pub fn from_bytes(bytes: &[u8; 4]) -> Self {
        let payload_length =
            u32::from(bytes[0]) | (u32::from(bytes[1]) << 8) | (u32::from(bytes[2]) << 16);
        Self {
            payload_length,
            sequence_id: bytes[3],
        }
    }

    pub fn to_bytes(&self) -> [u8; 4] {
        let len = self.payload_length.to_le_bytes();
        [len[0], len[1], len[2], self.sequence_id]
    }

    /// Is this a fragment that must be followed by a continuation packet?
    pub fn is_fragment(&self) -> bool {
        self.payload_length as usize == MAX_PACKET_SIZE
    }
}

/// Frame `payload` into one or more packets appended to `out`.
///
/// `sequence` holds the last sequence id used and is advanced once per
/// emitted packet. A payload whose length is a non-zero multiple of
/// [`MAX_PACKET_SIZE`] is followed by an empty packet so the peer can tell
/// it ended. An empty payload is sent as a single empty packet.
pub fn frame_payload(payload: &[u8], sequence: &mut u8, out: &mut Vec<u8>) {
    out.reserve(payload.len() + PacketHeader::SIZE);
    let mut last_len = 0;
    let mut wrote_any = false;
    for chunk in payload.chunks(MAX_PACKET_SIZE) {
        write_one(chunk, sequence, out);
        last_len = chunk.len();
        wrote_any = true;
    }
    if !wrote_any || last_len == MAX_PACKET_SIZE {
        write_one(&[], sequence, out);
    }
}

fn write_one(chunk: &[u8], sequence: &mut u8, out: &mut Vec<u8>) {
    *sequence = sequence.wrapping_add(1);
    let header = PacketHeader {
        payload_length: chunk.len() as u32,
        sequence_id: *sequence,
    };
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(chunk);
}
