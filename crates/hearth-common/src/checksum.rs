//! Checksum utilities
//!
//! Every persisted structure (fleet header, vdev records, log batches)
//! carries a CRC32C computed over the bytes preceding the checksum field.

/// Quick CRC32C computation
#[inline]
#[must_use]
pub fn compute_crc32c(data: &[u8]) -> u32 {
    crc32c::crc32c(data)
}

/// Quick CRC32C verification
#[inline]
#[must_use]
pub fn verify_crc32c(data: &[u8], expected: u32) -> bool {
    crc32c::crc32c(data) == expected
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_crc_roundtrip() {
        let data = b"hello, hearth!";
        let crc = compute_crc32c(data);
        assert!(verify_crc32c(data, crc));
        assert!(!verify_crc32c(b"hello, hearth?", crc));
    }
}
