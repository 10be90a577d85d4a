//! CRC-32C over structures carrying their own checksum field

use serde::Serialize;

/// A stored checksum that does not match the computed one
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ChecksumMismatch {
    pub stored: u32,
    pub computed: u32,
}

/// CRC-32C (Castagnoli)
pub fn crc32c(bytes: &[u8]) -> u32 {
    crc32c::crc32c(bytes)
}

/// CRC-32C of `bytes` as if the 4-byte field at `field_offset` were zero
pub fn checksum_with_zeroed_field(bytes: &[u8], field_offset: usize) -> u32 {
    let crc = crc32c::crc32c(&bytes[..field_offset]);
    let crc = crc32c::crc32c_append(crc, &[0u8; 4]);
    crc32c::crc32c_append(crc, &bytes[field_offset + 4..])
}

/// Check the little-endian checksum stored at `field_offset`
pub fn verify(bytes: &[u8], field_offset: usize) -> Result<(), ChecksumMismatch> {
    let stored = crate::layout::read_u32(bytes, field_offset);
    let computed = checksum_with_zeroed_field(bytes, field_offset);
    if stored == computed {
        Ok(())
    } else {
        Err(ChecksumMismatch { stored, computed })
    }
}

/// Compute and store the checksum at `field_offset`
#[cfg(test)]
pub(crate) fn seal(bytes: &mut [u8], field_offset: usize) {
    let crc = checksum_with_zeroed_field(bytes, field_offset);
    bytes[field_offset..field_offset + 4].copy_from_slice(&crc.to_le_bytes());
}
