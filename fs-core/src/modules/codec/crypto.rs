//! Block encryption and key management
//!
//! AES-256-GCM with a fresh random nonce for every sealed buffer. Data blocks
//! keep the nonce and tag next to their extent record so the ciphertext is
//! exactly as long as the plaintext.

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{Aead, AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use sha2::Sha256;

use crate::error::{Error, Result};
use crate::format::WRAPPED_KEY_LEN;

pub const KEY_LEN: usize = 32;
pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

/// A 256-bit symmetric key
pub type Key = [u8; KEY_LEN];

const KDF_INFO: &[u8] = b"aurorafs/v1 key derivation";

/// Fill `buf` from the OS random source
pub fn random_bytes(buf: &mut [u8]) -> Result<()> {
    getrandom::getrandom(buf)
        .map_err(|e| Error::CryptoFailure(format!("random source failed: {}", e)))
}

/// A fresh random key
pub fn random_key() -> Result<Key> {
    let mut key = [0u8; KEY_LEN];
    random_bytes(&mut key)?;
    Ok(key)
}

/// HKDF-SHA-256 of `master` under `salt`
///
/// Deterministic in both inputs; distinct salts give independent keys.
pub fn derive_key(master: &[u8], salt: &[u8]) -> Result<Key> {
    let hk = Hkdf::<Sha256>::new(Some(salt), master);
    let mut okm = [0u8; KEY_LEN];
    hk.expand(KDF_INFO, &mut okm)
        .map_err(|e| Error::CryptoFailure(format!("key derivation failed: {}", e)))?;
    Ok(okm)
}

fn derive_labeled(master: &[u8], volume_salt: &[u8], label: &[u8]) -> Result<Key> {
    let mut salt = Vec::with_capacity(volume_salt.len() + label.len());
    salt.extend_from_slice(volume_salt);
    salt.extend_from_slice(label);
    derive_key(master, &salt)
}

/// Value stored in the superblock to recognise the right master key
pub fn key_verifier(master: &[u8], volume_salt: &[u8]) -> Result<[u8; 32]> {
    derive_labeled(master, volume_salt, b"check")
}

/// Keys a mounted encrypted volume works with
#[derive(Clone)]
pub struct VolumeKeys {
    /// Wraps per-file content keys
    pub wrap: Key,
    /// Encrypts data blocks shared through the dedup index
    pub data: Key,
}

impl VolumeKeys {
    pub fn derive(master: &[u8], volume_salt: &[u8]) -> Result<Self> {
        Ok(Self {
            wrap: derive_labeled(master, volume_salt, b"wrap")?,
            data: derive_labeled(master, volume_salt, b"data")?,
        })
    }
}

impl std::fmt::Debug for VolumeKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("VolumeKeys { .. }")
    }
}

fn cipher(key: &Key) -> Result<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key)
        .map_err(|_| Error::CryptoFailure("bad key length".to_string()))
}

/// Encrypt `input` into `nonce || ciphertext || tag`
pub fn encrypt(key: &Key, input: &[u8]) -> Result<Vec<u8>> {
    let mut nonce = [0u8; NONCE_LEN];
    random_bytes(&mut nonce)?;
    let sealed = cipher(key)?
        .encrypt(Nonce::from_slice(&nonce), input)
        .map_err(|_| Error::CryptoFailure("encryption failed".to_string()))?;

    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Reverse [`encrypt`]; fails with `CryptoFailure` if authentication fails
pub fn decrypt(key: &Key, input: &[u8]) -> Result<Vec<u8>> {
    if input.len() < NONCE_LEN + TAG_LEN {
        return Err(Error::CryptoFailure(format!(
            "sealed buffer too short ({} bytes)",
            input.len()
        )));
    }
    let (nonce, sealed) = input.split_at(NONCE_LEN);
    cipher(key)?
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| Error::CryptoFailure("authentication failed".to_string()))
}

/// Encrypt `buf` in place, returning the nonce and tag to store beside it
pub fn seal_in_place(key: &Key, buf: &mut [u8]) -> Result<([u8; NONCE_LEN], [u8; TAG_LEN])> {
    let mut nonce = [0u8; NONCE_LEN];
    random_bytes(&mut nonce)?;
    let tag = cipher(key)?
        .encrypt_in_place_detached(Nonce::from_slice(&nonce), b"", buf)
        .map_err(|_| Error::CryptoFailure("encryption failed".to_string()))?;

    let mut tag_bytes = [0u8; TAG_LEN];
    tag_bytes.copy_from_slice(tag.as_slice());
    Ok((nonce, tag_bytes))
}

/// Decrypt a buffer sealed by [`seal_in_place`]
pub fn open_in_place(
    key: &Key,
    buf: &mut [u8],
    nonce: &[u8; NONCE_LEN],
    tag: &[u8; TAG_LEN],
) -> Result<()> {
    cipher(key)?
        .decrypt_in_place_detached(
            Nonce::from_slice(nonce),
            b"",
            buf,
            GenericArray::from_slice(tag),
        )
        .map_err(|_| Error::CryptoFailure("block authentication failed".to_string()))
}

/// Wrap a per-file content key for storage in its inode
pub fn wrap_key(wrapping: &Key, file_key: &Key) -> Result<[u8; WRAPPED_KEY_LEN]> {
    let sealed = encrypt(wrapping, file_key)?;
    let mut out = [0u8; WRAPPED_KEY_LEN];
    if sealed.len() != WRAPPED_KEY_LEN {
        return Err(Error::CryptoFailure(format!(
            "wrapped key is {} bytes",
            sealed.len()
        )));
    }
    out.copy_from_slice(&sealed);
    Ok(out)
}

/// Recover a per-file content key
pub fn unwrap_key(wrapping: &Key, wrapped: &[u8; WRAPPED_KEY_LEN]) -> Result<Key> {
    let plain = decrypt(wrapping, wrapped)?;
    let mut key = [0u8; KEY_LEN];
    if plain.len() != KEY_LEN {
        return Err(Error::CryptoFailure("unwrapped key has wrong length".to_string()));
    }
    key.copy_from_slice(&plain);
    Ok(key)
}
