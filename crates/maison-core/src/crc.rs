//! CRC32 used to guard the sleep-retaining memory regions.

/// Generator polynomial (normal, non-reflected form).
pub const POLYNOMIAL: u32 = 0x04C1_1DB7;

/// Initial register value.
pub const SEED: u32 = 0xFFFF_FFFF;

/// Bit-serial CRC32, most significant bit of each byte first.
///
/// Polynomial `0x04C11DB7`, seeded with `0xFFFFFFFF`, no input/output
/// reflection and no final inversion (the CRC-32/MPEG-2 parameter set). The
/// value is stored verbatim in the leading word of every persisted region, so
/// it must never change between firmware releases.
pub fn crc32(data: &[u8]) -> u32 {
    crc32_update(SEED, data)
}

/// Continue a CRC computation over `data` from a previous register value.
pub fn crc32_update(mut crc: u32, data: &[u8]) -> u32 {
    for &byte in data {
        let mut mask = 0x80u8;
        while mask != 0 {
            let mut bit = crc & 0x8000_0000 != 0;
            if byte & mask != 0 {
                bit = !bit;
            }
            crc <<= 1;
            if bit {
                crc ^= POLYNOMIAL;
            }
            mask >>= 1;
        }
    }

    crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_value() {
        assert_eq!(crc32(b"123456789"), 0x0376_E6E7);
    }

    #[test]
    fn test_empty_input_is_seed() {
        assert_eq!(crc32(&[]), SEED);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let data = b"maison/DEV_TEST/ctrl";
        let (head, tail) = data.split_at(7);
        assert_eq!(crc32_update(crc32(head), tail), crc32(data));
    }

    #[test]
    fn test_single_bit_flip_changes_crc() {
        let mut data = [0x5Au8; 24];
        let reference = crc32(&data);

        for byte in 0..data.len() {
            for bit in 0..8 {
                data[byte] ^= 1 << bit;
                assert_ne!(crc32(&data), reference, "flip at byte {byte} bit {bit}");
                data[byte] ^= 1 << bit;
            }
        }
    }
}
