//! Checksums protecting the on-disk header and batch descriptors.

use std::ops::Range;

/// CRC32C over `bytes`.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u32 {
    crc32c::crc32c(bytes)
}

/// CRC32C over `bytes` as if `field` were zero.
///
/// Used for structures that store their own checksum inline. `field` must lie
/// within `bytes`.
#[must_use]
pub fn checksum_with_zeroed(bytes: &[u8], field: Range<usize>) -> u32 {
    let zeros = [0_u8; 8];
    let width = field.end - field.start;
    debug_assert!(width <= zeros.len() && field.end <= bytes.len());
    let crc = crc32c::crc32c(&bytes[..field.start]);
    let crc = crc32c::crc32c_append(crc, &zeros[..width]);
    crc32c::crc32c_append(crc, &bytes[field.end..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zeroed_field_matches_explicit_zeroing() {
        let mut bytes: Vec<u8> = (0_u8..64).collect();
        let with_field = checksum_with_zeroed(&bytes, 8..12);
        bytes[8..12].fill(0);
        assert_eq!(with_field, checksum(&bytes));
    }

    #[test]
    fn any_flipped_bit_changes_the_sum() {
        let bytes = vec![0x5A_u8; 128];
        let base = checksum(&bytes);
        for idx in [0, 17, 127] {
            let mut flipped = bytes.clone();
            flipped[idx] ^= 0x01;
            assert_ne!(checksum(&flipped), base, "flip at {idx} went unnoticed");
        }
    }

    #[test]
    fn known_vector() {
        // RFC 3720 B.4: 32 bytes of zeros.
        assert_eq!(checksum(&[0_u8; 32]), 0x8A91_36AA);
    }
}
