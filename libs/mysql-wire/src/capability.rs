//! Capability flags advertised in the handshake.
//!
//! The server sends the 32-bit mask as two little-endian 16-bit halves: the
//! low half before the character set and status flags, the high half after.
//!
//! Reference: <https://dev.mysql.com/doc/dev/mysql-server/latest/group__group__cs__capabilities__flags.html>

use std::fmt;

/// 32-bit capability bitmask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CapabilityFlags(u32);

impl CapabilityFlags {
    pub const CLIENT_LONG_PASSWORD: Self = Self(1);
    pub const CLIENT_FOUND_ROWS: Self = Self(1 << 1);
    pub const CLIENT_LONG_FLAG: Self = Self(1 << 2);
    pub const CLIENT_CONNECT_WITH_DB: Self = Self(1 << 3);
    pub const CLIENT_NO_SCHEMA: Self = Self(1 << 4);
    pub const CLIENT_COMPRESS: Self = Self(1 << 5);
    pub const CLIENT_ODBC: Self = Self(1 << 6);
    pub const CLIENT_LOCAL_FILES: Self = Self(1 << 7);
    pub const CLIENT_IGNORE_SPACE: Self = Self(1 << 8);
    pub const CLIENT_PROTOCOL_41: Self = Self(1 << 9);
    pub const CLIENT_INTERACTIVE: Self = Self(1 << 10);
    pub const CLIENT_SSL: Self = Self(1 << 11);
    pub const CLIENT_IGNORE_SIGPIPE: Self = Self(1 << 12);
    pub const CLIENT_TRANSACTIONS: Self = Self(1 << 13);
    pub const CLIENT_RESERVED: Self = Self(1 << 14);
    /// Auth plugin data extends past the first 8 bytes.
    pub const CLIENT_SECURE_CONNECTION: Self = Self(1 << 15);
    pub const CLIENT_MULTI_STATEMENTS: Self = Self(1 << 16);
    pub const CLIENT_MULTI_RESULTS: Self = Self(1 << 17);
    pub const CLIENT_PS_MULTI_RESULTS: Self = Self(1 << 18);
    /// The auth-plugin-data length byte and plugin name are meaningful.
    pub const CLIENT_PLUGIN_AUTH: Self = Self(1 << 19);
    pub const CLIENT_CONNECT_ATTRS: Self = Self(1 << 20);
    pub const CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA: Self = Self(1 << 21);
    pub const CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS: Self = Self(1 << 22);
    pub const CLIENT_SESSION_TRACK: Self = Self(1 << 23);
    pub const CLIENT_DEPRECATE_EOF: Self = Self(1 << 24);
    pub const CLIENT_OPTIONAL_RESULTSET_METADATA: Self = Self(1 << 25);
    pub const CLIENT_ZSTD_COMPRESSION_ALGORITHM: Self = Self(1 << 26);
    pub const CLIENT_QUERY_ATTRIBUTES: Self = Self(1 << 27);
    pub const MULTI_FACTOR_AUTHENTICATION: Self = Self(1 << 28);
    pub const CLIENT_CAPABILITY_EXTENSION: Self = Self(1 << 29);
    pub const CLIENT_SSL_VERIFY_SERVER_CERT: Self = Self(1 << 30);
    pub const CLIENT_REMEMBER_OPTIONS: Self = Self(1 << 31);

    const NAMES: [(Self, &'static str); 32] = [
        (Self::CLIENT_LONG_PASSWORD, "CLIENT_LONG_PASSWORD"),
        (Self::CLIENT_FOUND_ROWS, "CLIENT_FOUND_ROWS"),
        (Self::CLIENT_LONG_FLAG, "CLIENT_LONG_FLAG"),
        (Self::CLIENT_CONNECT_WITH_DB, "CLIENT_CONNECT_WITH_DB"),
        (Self::CLIENT_NO_SCHEMA, "CLIENT_NO_SCHEMA"),
        (Self::CLIENT_COMPRESS, "CLIENT_COMPRESS"),
        (Self::CLIENT_ODBC, "CLIENT_ODBC"),
        (Self::CLIENT_LOCAL_FILES, "CLIENT_LOCAL_FILES"),
        (Self::CLIENT_IGNORE_SPACE, "CLIENT_IGNORE_SPACE"),
        (Self::CLIENT_PROTOCOL_41, "CLIENT_PROTOCOL_41"),
        (Self::CLIENT_INTERACTIVE, "CLIENT_INTERACTIVE"),
        (Self::CLIENT_SSL, "CLIENT_SSL"),
        (Self::CLIENT_IGNORE_SIGPIPE, "CLIENT_IGNORE_SIGPIPE"),
        (Self::CLIENT_TRANSACTIONS, "CLIENT_TRANSACTIONS"),
        (Self::CLIENT_RESERVED, "CLIENT_RESERVED"),
        (Self::CLIENT_SECURE_CONNECTION, "CLIENT_SECURE_CONNECTION"),
        (Self::CLIENT_MULTI_STATEMENTS, "CLIENT_MULTI_STATEMENTS"),
        (Self::CLIENT_MULTI_RESULTS, "CLIENT_MULTI_RESULTS"),
        (Self::CLIENT_PS_MULTI_RESULTS, "CLIENT_PS_MULTI_RESULTS"),
        (Self::CLIENT_PLUGIN_AUTH, "CLIENT_PLUGIN_AUTH"),
        (Self::CLIENT_CONNECT_ATTRS, "CLIENT_CONNECT_ATTRS"),
        (
            Self::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA,
            "CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA",
        ),
        (
            Self::CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS,
            "CLIENT_CAN_HANDLE_EXPIRED_PASSWORDS",
        ),
        (Self::CLIENT_SESSION_TRACK, "CLIENT_SESSION_TRACK"),
        (Self::CLIENT_DEPRECATE_EOF, "CLIENT_DEPRECATE_EOF"),
        (
            Self::CLIENT_OPTIONAL_RESULTSET_METADATA,
            "CLIENT_OPTIONAL_RESULTSET_METADATA",
        ),
        (
            Self::CLIENT_ZSTD_COMPRESSION_ALGORITHM,
            "CLIENT_ZSTD_COMPRESSION_ALGORITHM",
        ),
        (Self::CLIENT_QUERY_ATTRIBUTES, "CLIENT_QUERY_ATTRIBUTES"),
        (Self::MULTI_FACTOR_AUTHENTICATION, "MULTI_FACTOR_AUTHENTICATION"),
        (Self::CLIENT_CAPABILITY_EXTENSION, "CLIENT_CAPABILITY_EXTENSION"),
        (Self::CLIENT_SSL_VERIFY_SERVER_CERT, "CLIENT_SSL_VERIFY_SERVER_CERT"),
        (Self::CLIENT_REMEMBER_OPTIONS, "CLIENT_REMEMBER_OPTIONS"),
    ];

    /// Wrap a raw 32-bit mask.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    /// Assemble the mask from the two halves sent on the wire.
    pub const fn from_halves(low: u16, high: u16) -> Self {
        Self(low as u32 | (high as u32) << 16)
    }

    /// Raw 32-bit mask.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Lower 16 bits (sent before the character set).
    pub const fn low(self) -> u16 {
        (self.0 & 0xFFFF) as u16
    }

    /// Upper 16 bits (sent after the status flags).
    pub const fn high(self) -> u16 {
        (self.0 >> 16) as u16
    }

    /// True if every bit of `other` is set.
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CapabilityFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for CapabilityFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl From<u32> for CapabilityFlags {
    fn from(bits: u32) -> Self {
        Self(bits)
    }
}

impl From<CapabilityFlags> for u32 {
    fn from(flags: CapabilityFlags) -> Self {
        flags.0
    }
}

/// Renders set flags as `NAME | NAME`, or `0x0` when empty.
impl fmt::Display for CapabilityFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == 0 {
            return f.write_str("0x0");
        }

        let mut first = true;
        for (flag, name) in Self::NAMES.iter() {
            if self.contains(*flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}
