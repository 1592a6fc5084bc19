//! # plfm-mysql-wire
//!
//! MySQL client/server protocol codec, scoped to what a transparent proxy
//! needs to inspect: the packet header and the initial handshake (v10)
//! packet the server sends before authentication.
//!
//! ## Design Principles
//!
//! - Decoding never reads past the declared payload length
//! - Every short read reports the field it ran out on
//! - Decoded values are owned; no buffers are borrowed past `decode`
//! - `encode(decode(b))` is semantically equal to `b` (lengths are recomputed)
//!
//! ## Example
//!
//! ```
//! use plfm_mysql_wire::{CapabilityFlags, InitialHandshakePacket};
//!
//! let packet = InitialHandshakePacket {
//!     server_version: b"8.0.36".to_vec(),
//!     connection_id: 7,
//!     auth_plugin_name: b"mysql_native_password".to_vec(),
//!     capability_flags: CapabilityFlags::CLIENT_PROTOCOL_41,
//!     ..Default::default()
//! };
//!
//! let bytes = packet.encode().unwrap();
//! let decoded = InitialHandshakePacket::decode(&bytes).unwrap();
//! assert_eq!(decoded.server_version_str(), "8.0.36");
//! assert_eq!(decoded.connection_id, 7);
//! ```

mod capability;
mod cursor;
mod error;
mod handshake;
mod header;

pub use capability::CapabilityFlags;
pub use error::{Result, WireError};
pub use handshake::{
    InitialHandshakePacket, AUTH_PLUGIN_DATA_PART_1_LEN, MAX_HANDSHAKE_PAYLOAD, PROTOCOL_VERSION,
};
pub use header::{PacketHeader, HEADER_LEN};
