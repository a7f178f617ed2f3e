//! Block compression

use crate::error::{Error, Result};
use crate::format::CompressionAlgorithm;

/// zstd level used for data blocks
const ZSTD_LEVEL: i32 = 3;

/// Compress `input` with `algorithm`
///
/// Returns the algorithm actually used with its output. A block that would
/// not shrink is returned unchanged under [`CompressionAlgorithm::None`], so
/// the output is never larger than the input.
pub fn compress(algorithm: CompressionAlgorithm, input: &[u8]) -> Result<(CompressionAlgorithm, Vec<u8>)> {
    let output = match algorithm {
        CompressionAlgorithm::None => return Ok((CompressionAlgorithm::None, input.to_vec())),
        CompressionAlgorithm::Lz4 => lz4_flex::compress(input),
        CompressionAlgorithm::Zstd => zstd::bulk::compress(input, ZSTD_LEVEL)?,
    };

    if output.len() >= input.len() {
        log::trace!(
            "CODEC: {} expanded {} -> {} bytes, storing raw",
            algorithm.name(),
            input.len(),
            output.len()
        );
        return Ok((CompressionAlgorithm::None, input.to_vec()));
    }
    Ok((algorithm, output))
}

/// Reverse [`compress`]; the result must be exactly `expected_size` bytes
pub fn decompress(algorithm: CompressionAlgorithm, input: &[u8], expected_size: usize) -> Result<Vec<u8>> {
    let output = match algorithm {
        CompressionAlgorithm::None => input.to_vec(),
        CompressionAlgorithm::Lz4 => lz4_flex::decompress(input, expected_size)
            .map_err(|e| Error::format(format!("lz4 payload is corrupt: {}", e)))?,
        CompressionAlgorithm::Zstd => zstd::bulk::decompress(input, expected_size)
            .map_err(|e| Error::format(format!("zstd payload is corrupt: {}", e)))?,
    };

    if output.len() != expected_size {
        return Err(Error::format(format!(
            "{} payload decoded to {} bytes, expected {}",
            algorithm.name(),
            output.len(),
            expected_size
        )));
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, RngCore, SeedableRng};

    const ALL: [CompressionAlgorithm; 3] = [
        CompressionAlgorithm::None,
        CompressionAlgorithm::Lz4,
        CompressionAlgorithm::Zstd,
    ];

    fn inputs() -> Vec<Vec<u8>> {
        let mut rng = StdRng::seed_from_u64(42);
        let mut random = vec![0u8; 4096];
        rng.fill_bytes(&mut random);
        let text = b"aurora borealis ".repeat(256);
        vec![Vec::new(), vec![0u8; 4096], random, text, b"x".to_vec()]
    }

    #[test]
    fn test_round_trip_all_algorithms() {
        for algorithm in ALL {
            for input in inputs() {
                let (used, output) = compress(algorithm, &input).unwrap();
                assert!(output.len() <= input.len());
                let restored = decompress(used, &output, input.len()).unwrap();
                assert_eq!(restored, input, "{:?} round trip", algorithm);
            }
        }
    }

    #[test]
    fn test_none_is_identity() {
        let input = b"unchanged bytes".to_vec();
        let (used, output) = compress(CompressionAlgorithm::None, &input).unwrap();
        assert_eq!(used, CompressionAlgorithm::None);
        assert_eq!(output, input);
    }

    #[test]
    fn test_incompressible_falls_back_to_none() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut random = vec![0u8; 4096];
        rng.fill_bytes(&mut random);
        for algorithm in [CompressionAlgorithm::Lz4, CompressionAlgorithm::Zstd] {
            let (used, output) = compress(algorithm, &random).unwrap();
            assert_eq!(used, CompressionAlgorithm::None);
            assert_eq!(output, random);
        }
    }

    #[test]
    fn test_compressible_shrinks() {
        let zeros = vec![0u8; 4096];
        let (used, output) = compress(CompressionAlgorithm::Zstd, &zeros).unwrap();
        assert_eq!(used, CompressionAlgorithm::Zstd);
        assert!(output.len() < 100);
    }

    #[test]
    fn test_size_mismatch_is_a_format_error() {
        let (used, output) = compress(CompressionAlgorithm::Lz4, &[7u8; 4096]).unwrap();
        assert!(matches!(decompress(used, &output, 100), Err(Error::Format(_))));
        assert!(matches!(
            decompress(CompressionAlgorithm::None, b"abc", 4),
            Err(Error::Format(_))
        ));
    }
}
