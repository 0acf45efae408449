//! Bounds-checked little-endian reader over container bytes.

use crate::error::UnlockError;

pub(super) struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub(super) const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub(super) const fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub(super) const fn position(&self) -> usize {
        self.pos
    }

    pub(super) fn rest(&self) -> &'a [u8] {
        self.data.get(self.pos..).unwrap_or_default()
    }

    pub(super) fn is_empty(&self) -> bool {
        self.rest().is_empty()
    }

    pub(super) fn take(&mut self, len: usize) -> Result<&'a [u8], UnlockError> {
        let end = self
            .pos
            .checked_add(len)
            .ok_or_else(|| UnlockError::corrupted("length overflow"))?;
        let slice = self.data.get(self.pos..end).ok_or_else(|| {
            UnlockError::corrupted(format!(
                "unexpected end of data at byte {} (wanted {len} more)",
                self.pos
            ))
        })?;
        self.pos = end;
        Ok(slice)
    }

    pub(super) fn array<const N: usize>(&mut self) -> Result<[u8; N], UnlockError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub(super) fn u8(&mut self) -> Result<u8, UnlockError> {
        Ok(self.array::<1>()?[0])
    }

    pub(super) fn u16(&mut self) -> Result<u16, UnlockError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub(super) fn u32(&mut self) -> Result<u32, UnlockError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub(super) fn u64(&mut self) -> Result<u64, UnlockError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    /// Little-endian `i32` length prefix; negative values are corruption.
    pub(super) fn len_i32(&mut self) -> Result<usize, UnlockError> {
        let raw = i32::from_le_bytes(self.array()?);
        usize::try_from(raw).map_err(|_| UnlockError::corrupted(format!("negative length {raw}")))
    }
}

/// Fixed-width little-endian integer from a header field.
pub(super) fn le_u32(field: &[u8], name: &str) -> Result<u32, UnlockError> {
    let bytes: [u8; 4] = field
        .try_into()
        .map_err(|_| UnlockError::corrupted(format!("{name} must be 4 bytes")))?;
    Ok(u32::from_le_bytes(bytes))
}

/// Fixed-width little-endian integer from a header field.
pub(super) fn le_u64(field: &[u8], name: &str) -> Result<u64, UnlockError> {
    let bytes: [u8; 8] = field
        .try_into()
        .map_err(|_| UnlockError::corrupted(format!("{name} must be 8 bytes")))?;
    Ok(u64::from_le_bytes(bytes))
}
