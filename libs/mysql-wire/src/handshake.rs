//! Protocol::HandshakeV10, the first packet a server sends on a new connection.
//!
//! Payload layout (all integers little-endian):
//!
//! ```text
//! 1    protocol_version            always 10
//! n+1  server_version              null-terminated
//! 4    connection_id
//! 8    auth_plugin_data_part_1
//! 1    filler                      always 0x00
//! 2    capability_flags (low)
//! 1    character_set
//! 2    status_flags
//! 2    capability_flags (high)
//! 1    auth_plugin_data_len        0 unless CLIENT_PLUGIN_AUTH
//! 10   reserved
//! m    auth_plugin_data_part_2     if CLIENT_SECURE_CONNECTION, m = max(13, len - 8)
//! k    auth_plugin_name            null-terminated, or rest of payload
//! ```
//!
//! Reference: <https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_connection_phase_packets_protocol_handshake_v10.html>

use std::borrow::Cow;

use tokio::io::{AsyncRead, AsyncReadExt};

use crate::capability::CapabilityFlags;
use crate::cursor::Cursor;
use crate::error::{Result, WireError};
use crate::header::{PacketHeader, HEADER_LEN};

/// The only protocol version this codec understands.
pub const PROTOCOL_VERSION: u8 = 10;

/// Length of the first auth-plugin-data segment.
pub const AUTH_PLUGIN_DATA_PART_1_LEN: usize = 8;

/// Minimum length of the second auth-plugin-data segment.
const AUTH_PLUGIN_DATA_PART_2_MIN_LEN: i32 = 13;

/// Reserved bytes between the auth-plugin-data length and the second segment.
const RESERVED_LEN: usize = 10;

/// Upper bound on a handshake payload read from a stream.
///
/// Real handshakes are well under 1 KiB; anything near this size is not a
/// handshake and is refused before the payload is allocated.
pub const MAX_HANDSHAKE_PAYLOAD: usize = 64 * 1024;

/// Decoded initial handshake packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialHandshakePacket {
    /// Header the packet arrived with; its sequence id is reused on encode.
    pub header: PacketHeader,
    /// Protocol version (10).
    pub protocol_version: u8,
    /// Server version, without the null terminator.
    pub server_version: Vec<u8>,
    /// Server-side connection (thread) id.
    pub connection_id: u32,
    /// Auth plugin data: the 8-byte first segment, followed by the second
    /// segment when CLIENT_SECURE_CONNECTION is set.
    pub auth_plugin_data: Vec<u8>,
    /// Combined capability flags.
    pub capability_flags: CapabilityFlags,
    /// Default collation id.
    pub character_set: u8,
    /// Server status flags.
    pub status_flags: u16,
    /// Total auth plugin data length; zero unless CLIENT_PLUGIN_AUTH is set.
    pub auth_plugin_data_length: u8,
    /// Auth plugin name, without the null terminator.
    pub auth_plugin_name: Vec<u8>,
}

impl Default for InitialHandshakePacket {
    fn default() -> Self {
        Self {
            header: PacketHeader::default(),
            protocol_version: PROTOCOL_VERSION,
            server_version: Vec::new(),
            connection_id: 0,
            auth_plugin_data: vec![0u8; AUTH_PLUGIN_DATA_PART_1_LEN],
            capability_flags: CapabilityFlags::default(),
            character_set: 0,
            status_flags: 0,
            auth_plugin_data_length: 0,
            auth_plugin_name: Vec::new(),
        }
    }
}

impl InitialHandshakePacket {
    /// Decode a packet (header + payload) from the front of `data`.
    ///
    /// Bytes past the declared payload length are ignored.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = PacketHeader::parse(data)?;
        let body = &data[HEADER_LEN..];
        let payload = body
            .get(..header.payload_len())
            .ok_or(WireError::TruncatedPacket {
                field: "payload",
                needed: header.payload_len(),
                available: body.len(),
            })?;
        Self::decode_payload(header, payload)
    }

    /// Read exactly one packet from `reader` and decode it.
    ///
    /// Reads the 4-byte header and then exactly the declared payload, so any
    /// bytes the server sends afterwards stay in the stream.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Self> {
        let mut header_buf = [0u8; HEADER_LEN];
        reader.read_exact(&mut header_buf).await?;
        let header = PacketHeader::from_bytes(header_buf);

        if header.payload_len() > MAX_HANDSHAKE_PAYLOAD {
            return Err(WireError::PacketTooLarge {
                length: header.payload_len(),
                max: MAX_HANDSHAKE_PAYLOAD,
            });
        }

        let mut payload = vec![0u8; header.payload_len()];
        reader.read_exact(&mut payload).await?;
        Self::decode_payload(header, &payload)
    }

    /// Decode a payload whose header has already been read.
    pub fn decode_payload(header: PacketHeader, payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);

        let protocol_version = cursor.read_u8("protocol_version")?;
        if protocol_version != PROTOCOL_VERSION {
            return Err(WireError::UnsupportedProtocol(protocol_version));
        }

        let server_version = cursor.read_null_terminated("server_version")?.to_vec();
        let connection_id = cursor.read_u32_le("connection_id")?;

        let mut auth_plugin_data = cursor
            .read_bytes(AUTH_PLUGIN_DATA_PART_1_LEN, "auth_plugin_data_part_1")?
            .to_vec();

        let filler = cursor.read_u8("filler")?;
        if filler != 0 {
            return Err(WireError::MalformedFiller(filler));
        }

        let capability_low = cursor.read_u16_le("capability_flags_lower")?;
        let character_set = cursor.read_u8("character_set")?;
        let status_flags = cursor.read_u16_le("status_flags")?;
        let capability_high = cursor.read_u16_le("capability_flags_upper")?;
        let capability_flags = CapabilityFlags::from_halves(capability_low, capability_high);

        // The length byte is always on the wire; it only carries meaning with plugin auth.
        let raw_auth_len = cursor.read_u8("auth_plugin_data_length")?;
        let auth_plugin_data_length =
            if capability_flags.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH) {
                if raw_auth_len == 0 {
                    return Err(WireError::InvalidAuthPluginDataLength);
                }
                raw_auth_len
            } else {
                0
            };

        cursor.skip(RESERVED_LEN, "reserved")?;

        if capability_flags.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
            let part_2_len = AUTH_PLUGIN_DATA_PART_2_MIN_LEN
                .max(i32::from(auth_plugin_data_length) - AUTH_PLUGIN_DATA_PART_1_LEN as i32)
                as usize;
            auth_plugin_data
                .extend_from_slice(cursor.read_bytes(part_2_len, "auth_plugin_data_part_2")?);
        }

        let auth_plugin_name = cursor.read_until_null_or_end().to_vec();

        Ok(Self {
            header,
            protocol_version,
            server_version,
            connection_id,
            auth_plugin_data,
            capability_flags,
            character_set,
            status_flags,
            auth_plugin_data_length,
            auth_plugin_name,
        })
    }

    /// Encode to wire bytes (header + payload).
    ///
    /// The length is recomputed from the payload; the sequence id comes from
    /// the decoded header.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let part_1 = self
            .auth_plugin_data
            .get(..AUTH_PLUGIN_DATA_PART_1_LEN)
            .ok_or(WireError::TruncatedPacket {
                field: "auth_plugin_data_part_1",
                needed: AUTH_PLUGIN_DATA_PART_1_LEN,
                available: self.auth_plugin_data.len(),
            })?;
        let part_2 = &self.auth_plugin_data[AUTH_PLUGIN_DATA_PART_1_LEN..];

        let payload_len = 1
            + self.server_version.len()
            + 1
            + 4
            + AUTH_PLUGIN_DATA_PART_1_LEN
            + 1
            + 2
            + 1
            + 2
            + 2
            + 1
            + RESERVED_LEN
            + part_2.len()
            + self.auth_plugin_name.len()
            + 1;
        let header = PacketHeader::for_payload(payload_len, self.header.sequence_id)?;

        let mut buf = Vec::with_capacity(HEADER_LEN + payload_len);
        buf.extend_from_slice(&header.to_bytes());
        buf.push(self.protocol_version);
        buf.extend_from_slice(&self.server_version);
        buf.push(0x00);
        buf.extend_from_slice(&self.connection_id.to_le_bytes());
        buf.extend_from_slice(part_1);
        buf.push(0x00);
        buf.extend_from_slice(&self.capability_flags.low().to_le_bytes());
        buf.push(self.character_set);
        buf.extend_from_slice(&self.status_flags.to_le_bytes());
        buf.extend_from_slice(&self.capability_flags.high().to_le_bytes());
        buf.push(self.auth_plugin_data_length);
        buf.extend_from_slice(&[0u8; RESERVED_LEN]);
        buf.extend_from_slice(part_2);
        buf.extend_from_slice(&self.auth_plugin_name);
        buf.push(0x00);

        debug_assert_eq!(buf.len(), HEADER_LEN + payload_len);
        Ok(buf)
    }

    /// Server version as text (lossy for non-UTF-8 bytes).
    pub fn server_version_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.server_version)
    }

    /// Auth plugin name as text (lossy for non-UTF-8 bytes).
    pub fn auth_plugin_name_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.auth_plugin_name)
    }

    /// Sequence id the packet arrived with.
    pub fn sequence_id(&self) -> u8 {
        self.header.sequence_id
    }
}
