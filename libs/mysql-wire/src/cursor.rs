//! Bounds-checked reader over a packet payload.

use crate::error::{Result, WireError};

/// Forward-only cursor. Every read names the field it is reading so a short
/// payload reports exactly where it ran out.
pub(crate) struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub(crate) fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub(crate) fn read_bytes(&mut self, n: usize, field: &'static str) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.data.len())
            .ok_or(WireError::TruncatedPacket {
                field,
                needed: n,
                available: self.remaining(),
            })?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub(crate) fn read_array<const N: usize>(&mut self, field: &'static str) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N, field)?);
        Ok(out)
    }

    pub(crate) fn read_u8(&mut self, field: &'static str) -> Result<u8> {
        Ok(self.read_array::<1>(field)?[0])
    }

    pub(crate) fn read_u16_le(&mut self, field: &'static str) -> Result<u16> {
        Ok(u16::from_le_bytes(self.read_array(field)?))
    }

    pub(crate) fn read_u32_le(&mut self, field: &'static str) -> Result<u32> {
        Ok(u32::from_le_bytes(self.read_array(field)?))
    }

    pub(crate) fn skip(&mut self, n: usize, field: &'static str) -> Result<()> {
        self.read_bytes(n, field).map(|_| ())
    }

    /// Bytes up to the next null; the null is consumed but not returned.
    pub(crate) fn read_null_terminated(&mut self, field: &'static str) -> Result<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let idx = rest
            .iter()
            .position(|b| *b == 0)
            .ok_or(WireError::TruncatedPacket {
                field,
                needed: rest.len() + 1,
                available: rest.len(),
            })?;
        self.pos += idx + 1;
        Ok(&rest[..idx])
    }

    /// Bytes up to the next null if one exists, otherwise everything left.
    pub(crate) fn read_until_null_or_end(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        match rest.iter().position(|b| *b == 0) {
            Some(idx) => {
                self.pos += idx + 1;
                &rest[..idx]
            }
            None => {
                self.pos = self.data.len();
                rest
            }
        }
    }
}
