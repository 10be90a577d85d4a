//! Allocation limits and checked arithmetic
//!
//! Every size read from an image is attacker controlled. Buffers sized from
//! on-disk fields go through these helpers before anything is allocated.

use crate::Error;

/// Largest log region the replayer will read in one piece (256 MB)
pub const MAX_LOG_BYTES: usize = 256 * 1024 * 1024;

/// Largest number of BAT entries decoded into memory
///
/// 32M entries is a 256 MB table, enough for a 64 TB disk at the minimum
/// 1 MB block size with a 4K logical sector.
pub const MAX_BAT_ENTRIES: u64 = 32 * 1024 * 1024;

/// Largest metadata item payload (the format caps items at 1 MB)
pub const MAX_METADATA_ITEM_BYTES: u32 = 1024 * 1024;

/// Maximum file size for memory mapping (16 GB)
pub const MAX_MMAP_SIZE: u64 = 16 * 1024 * 1024 * 1024;

/// Validate that a size is within allocation limits
pub fn validate_allocation_size(size: u64, limit: usize, context: &str) -> crate::Result<usize> {
    if size > limit as u64 {
        return Err(Error::unsupported(format!(
            "{} size {} exceeds limit {}",
            context, size, limit
        )));
    }

    u64_to_usize(size, context)
}

/// Multiply two u64 values, failing on overflow
pub fn checked_multiply_u64(a: u64, b: u64, context: &str) -> crate::Result<u64> {
    a.checked_mul(b)
        .ok_or_else(|| Error::invalid_structure(format!("{}: multiplication overflow", context)))
}

/// Add two u64 values, failing on overflow
pub fn checked_add_u64(a: u64, b: u64, context: &str) -> crate::Result<u64> {
    a.checked_add(b)
        .ok_or_else(|| Error::invalid_structure(format!("{}: addition overflow", context)))
}

/// Convert u64 to usize, failing on 32-bit truncation
pub fn u64_to_usize(value: u64, context: &str) -> crate::Result<usize> {
    value.try_into().map_err(|_| {
        Error::unsupported(format!(
            "{}: value {} exceeds platform usize limit",
            context, value
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_allocation_size_within_limit() {
        assert_eq!(validate_allocation_size(4096, 8192, "log").unwrap(), 4096);
        assert_eq!(validate_allocation_size(8192, 8192, "log").unwrap(), 8192);
    }

    #[test]
    fn test_validate_allocation_size_exceeds_limit() {
        let err = validate_allocation_size(8193, 8192, "log").unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert!(err.to_string().contains("log size 8193"));
    }

    #[test]
    fn test_checked_multiply_u64() {
        assert_eq!(checked_multiply_u64(1 << 20, 32, "bat").unwrap(), 32 << 20);
        assert!(checked_multiply_u64(u64::MAX, 2, "bat").is_err());
    }

    #[test]
    fn test_checked_add_u64() {
        assert_eq!(checked_add_u64(1, 2, "region").unwrap(), 3);
        let err = checked_add_u64(u64::MAX, 1, "region").unwrap_err();
        assert!(matches!(err, Error::InvalidStructure(_)));
    }

    #[test]
    fn test_u64_to_usize() {
        assert_eq!(u64_to_usize(1234, "len").unwrap(), 1234);
    }
}
