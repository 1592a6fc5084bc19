//! Packet header: 3-byte little-endian payload length + 1-byte sequence id.
//!
//! Reference: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_packets.html>

use crate::error::{Result, WireError};

/// Size of the packet header on the wire.
pub const HEADER_LEN: usize = 4;

/// Packet header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload length, excluding the header itself (24-bit).
    pub length: u32,
    /// Sequence id of this packet within the exchange.
    pub sequence_id: u8,
}

impl PacketHeader {
    /// Maximum payload size (2^24 - 1).
    pub const MAX_PAYLOAD_LENGTH: u32 = 0xFF_FF_FF;

    /// Create a new packet header.
    pub fn new(length: u32, sequence_id: u8) -> Self {
        Self {
            length,
            sequence_id,
        }
    }

    /// Header for a payload of `len` bytes, failing if it does not fit 24 bits.
    pub fn for_payload(len: usize, sequence_id: u8) -> Result<Self> {
        let length = u32::try_from(len)
            .ok()
            .filter(|l| *l <= Self::MAX_PAYLOAD_LENGTH)
            .ok_or(WireError::PacketTooLarge {
                length: len,
                max: Self::MAX_PAYLOAD_LENGTH as usize,
            })?;
        Ok(Self::new(length, sequence_id))
    }

    /// Parse the 4 header bytes.
    pub fn from_bytes(bytes: [u8; HEADER_LEN]) -> Self {
        Self {
            length: u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]),
            sequence_id: bytes[3],
        }
    }

    /// Parse the header at the front of `data`.
    pub fn parse(data: &[u8]) -> Result<Self> {
        let bytes: [u8; HEADER_LEN] = data
            .get(..HEADER_LEN)
            .and_then(|b| b.try_into().ok())
            .ok_or(WireError::TruncatedPacket {
                field: "header",
                needed: HEADER_LEN,
                available: data.len(),
            })?;
        Ok(Self::from_bytes(bytes))
    }

    /// Serialize to the 4 wire bytes. Only the low 24 bits of `length` are kept.
    pub fn to_bytes(self) -> [u8; HEADER_LEN] {
        let len = self.length.to_le_bytes();
        [len[0], len[1], len[2], self.sequence_id]
    }

    /// Payload length as usize.
    pub fn payload_len(self) -> usize {
        self.length as usize
    }
}
