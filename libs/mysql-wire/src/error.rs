//! Error types for the wire codec.

use thiserror::Error;

/// Errors produced while decoding or encoding wire packets.
#[derive(Debug, Error)]
pub enum WireError {
    /// The server speaks a protocol version other than 10.
    #[error("unsupported protocol version {0}: only version 10 is supported")]
    UnsupportedProtocol(u8),

    /// The filler byte after the first auth-plugin-data segment was not zero.
    #[error("malformed filler byte 0x{0:02x}: expected 0x00")]
    MalformedFiller(u8),

    /// CLIENT_PLUGIN_AUTH is set but the auth-plugin-data length is zero.
    #[error("invalid auth plugin data length: 0 with CLIENT_PLUGIN_AUTH set")]
    InvalidAuthPluginDataLength,

    /// A field extends past the end of the available bytes.
    #[error("truncated packet: {field} needs {needed} bytes, {available} available")]
    TruncatedPacket {
        field: &'static str,
        needed: usize,
        available: usize,
    },

    /// A payload length does not fit the 3-byte length field (or a configured cap).
    #[error("packet too large: {length} bytes exceeds maximum of {max}")]
    PacketTooLarge { length: usize, max: usize },

    /// I/O error while reading a packet from a stream.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl WireError {
    /// Stable snake_case label for logs.
    pub fn reason_code(&self) -> &'static str {
        match self {
            WireError::UnsupportedProtocol(_) => "unsupported_protocol",
            WireError::MalformedFiller(_) => "malformed_filler",
            WireError::InvalidAuthPluginDataLength => "invalid_auth_plugin_data_length",
            WireError::TruncatedPacket { .. } => "truncated_packet",
            WireError::PacketTooLarge { .. } => "packet_too_large",
            WireError::Io(_) => "io_error",
        }
    }
}

/// Result alias for codec operations.
pub type Result<T> = std::result::Result<T, WireError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_truncated_display() {
        let err = WireError::TruncatedPacket {
            field: "connection_id",
            needed: 4,
            available: 1,
        };
        assert_eq!(
            err.to_string(),
            "truncated packet: connection_id needs 4 bytes, 1 available"
        );
        assert_eq!(err.reason_code(), "truncated_packet");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::UnexpectedEof, "early eof");
        let err: WireError = io_err.into();
        assert!(err.to_string().contains("early eof"));
        assert_eq!(err.reason_code(), "io_error");
    }
}
