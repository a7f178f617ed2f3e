//! Codec pipeline
//!
//! Write path: compress, hash the compressed payload, then encrypt.
//! Read path: decrypt, then decompress.

mod compression;
mod crypto;

use ring::digest::{Context, SHA256};

use crate::format::CompressionAlgorithm;

pub use self::compression::{compress, decompress};
pub use self::crypto::{
    decrypt, derive_key, encrypt, key_verifier, open_in_place, random_bytes, random_key,
    seal_in_place, unwrap_key, wrap_key, Key, VolumeKeys, KEY_LEN, NONCE_LEN, TAG_LEN,
};

/// SHA-256 digest
pub type Hash = [u8; 32];

/// Content hash of one block
///
/// Covers the compression tag, the logical size and the compressed payload,
/// so it does not depend on keys or nonces.
pub fn content_hash(compression: CompressionAlgorithm, logical_size: u32, payload: &[u8]) -> Hash {
    let mut ctx = Context::new(&SHA256);
    ctx.update(&[compression as u8]);
    ctx.update(&logical_size.to_le_bytes());
    ctx.update(payload);
    finish(ctx)
}

/// Whole-file hash over the file size and its ordered block hashes
pub fn file_hash<'a>(size: u64, block_hashes: impl IntoIterator<Item = &'a Hash>) -> Hash {
    let mut ctx = Context::new(&SHA256);
    ctx.update(&size.to_le_bytes());
    for hash in block_hashes {
        ctx.update(hash);
    }
    finish(ctx)
}

fn finish(ctx: Context) -> Hash {
    let mut out = [0u8; 32];
    out.copy_from_slice(ctx.finish().as_ref());
    out
}

/// A block after compression and hashing, before encryption
#[derive(Debug, Clone)]
pub struct PreparedBlock {
    pub compression: CompressionAlgorithm,
    pub logical_size: u32,
    pub payload: Vec<u8>,
    pub hash: Hash,
}

/// Compress and hash one block of logical data
pub fn prepare_block(
    algorithm: CompressionAlgorithm,
    data: &[u8],
) -> crate::error::Result<PreparedBlock> {
    let (compression, payload) = compress(algorithm, data)?;
    let logical_size = data.len() as u32;
    let hash = content_hash(compression, logical_size, &payload);
    Ok(PreparedBlock {
        compression,
        logical_size,
        payload,
        hash,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_covers_tag_and_size() {
        let a = content_hash(CompressionAlgorithm::None, 4, b"abcd");
        assert_eq!(a, content_hash(CompressionAlgorithm::None, 4, b"abcd"));
        assert_ne!(a, content_hash(CompressionAlgorithm::Lz4, 4, b"abcd"));
        assert_ne!(a, content_hash(CompressionAlgorithm::None, 5, b"abcd"));
        assert_ne!(a, content_hash(CompressionAlgorithm::None, 4, b"abce"));
    }

    #[test]
    fn test_prepare_block_is_deterministic() {
        let data = vec![0x33u8; 4096];
        let a = prepare_block(CompressionAlgorithm::Lz4, &data).unwrap();
        let b = prepare_block(CompressionAlgorithm::Lz4, &data).unwrap();
        assert_eq!(a.hash, b.hash);
        assert_eq!(a.compression, CompressionAlgorithm::Lz4);
        assert!(a.payload.len() < data.len());
        assert_eq!(
            decompress(a.compression, &a.payload, a.logical_size as usize).unwrap(),
            data
        );
    }

    #[test]
    fn test_file_hash_orders_blocks() {
        let h1 = [1u8; 32];
        let h2 = [2u8; 32];
        assert_ne!(file_hash(8192, [&h1, &h2]), file_hash(8192, [&h2, &h1]));
        assert_ne!(file_hash(8192, [&h1]), file_hash(8191, [&h1]));
    }
}
