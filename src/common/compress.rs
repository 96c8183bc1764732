//! Value compression codec
//!
//! The wire protocol carries a compressed/uncompressed flag per value. The
//! codec contract: `decompress(compress(x)) == x`, and a sender falls back
//! to raw bytes whenever compression does not shrink the value.

use crate::common::Result;

/// Values below this size are always sent raw.
const COMPRESSION_MIN: usize = 1024;

const ZSTD_LEVEL: i32 = 1;

/// Compress a value if it pays off.
///
/// Returns `(bytes, true)` with the compressed form when it is strictly
/// smaller than the input, `(input, false)` otherwise.
pub fn compress(data: &[u8]) -> (Vec<u8>, bool) {
    if data.len() < COMPRESSION_MIN {
        return (data.to_vec(), false);
    }

    match zstd::bulk::compress(data, ZSTD_LEVEL) {
        Ok(compressed) if compressed.len() < data.len() => (compressed, true),
        _ => (data.to_vec(), false),
    }
}

/// Inverse of [`compress`]. `capacity` bounds the decompressed size.
pub fn decompress(data: &[u8], compressed: bool, capacity: usize) -> Result<Vec<u8>> {
    if !compressed {
        return Ok(data.to_vec());
    }

    zstd::bulk::decompress(data, capacity)
        .map_err(|e| crate::Error::Corrupted(format!("zstd decompress: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::MAX_VALUE_SIZE;

    #[test]
    fn test_roundtrip() {
        let data = vec![42u8; 64 * 1024];
        let (encoded, compressed) = compress(&data);
        assert!(compressed);
        assert!(encoded.len() < data.len());

        let decoded = decompress(&encoded, compressed, MAX_VALUE_SIZE).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_small_values_stay_raw() {
        let data = b"hello".to_vec();
        let (encoded, compressed) = compress(&data);
        assert!(!compressed);
        assert_eq!(encoded, data);
    }

    #[test]
    fn test_incompressible_stays_raw() {
        // A pseudo-random buffer that zstd cannot shrink.
        let mut data = vec![0u8; 8192];
        let mut state = 0x9e3779b97f4a7c15u64;
        for byte in data.iter_mut() {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            *byte = (state >> 33) as u8;
        }

        let (encoded, compressed) = compress(&data);
        if compressed {
            assert!(encoded.len() < data.len());
        } else {
            assert_eq!(encoded, data);
        }
    }

    #[test]
    fn test_raw_passthrough() {
        let data = b"plain".to_vec();
        let decoded = decompress(&data, false, MAX_VALUE_SIZE).unwrap();
        assert_eq!(decoded, data);
    }
}
