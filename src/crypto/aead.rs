// AEAD record protection for data packets.
// Numan Thabit 2025

use chacha20poly1305::{
    aead::{Aead, Payload},
    ChaCha20Poly1305, KeyInit, Nonce,
};
use thiserror::Error;

/// Authentication tag length.
pub const TAG_LEN: usize = 16;

/// Nonce length for ChaCha20-Poly1305.
pub const NONCE_LEN: usize = 12;

/// Directional nonce salt length; the remaining nonce bytes carry the
/// packet number.
pub const NONCE_SALT_LEN: usize = 4;

/// A directional AEAD key.
#[derive(Clone, PartialEq, Eq)]
pub struct AeadKey([u8; 32]);

impl AeadKey {
    pub const fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for AeadKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AeadKey(..)")
    }
}

/// Errors returned by AEAD helpers.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AeadError {
    /// Encryption failed.
    #[error("encryption failed")]
    Encrypt,
    /// Decryption or authentication failed.
    #[error("decryption failed")]
    Decrypt,
}

/// Builds the per-packet nonce: directional salt followed by the full
/// 64-bit packet number, little endian.  Packet numbers never repeat within
/// a session, so neither do nonces.
pub fn packet_nonce(salt: &[u8; NONCE_SALT_LEN], packet_number: u64) -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..NONCE_SALT_LEN].copy_from_slice(salt);
    nonce[NONCE_SALT_LEN..].copy_from_slice(&packet_number.to_le_bytes());
    nonce
}

/// Encrypts `plaintext`, returning ciphertext concatenated with the tag.
pub fn seal(
    key: &AeadKey,
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    plaintext: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = ChaCha20Poly1305::new((&key.0).into());
    cipher
        .encrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: plaintext,
                aad,
            },
        )
        .map_err(|_| AeadError::Encrypt)
}

/// Decrypts ciphertext+tag produced by [`seal`].
pub fn open(
    key: &AeadKey,
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, AeadError> {
    let cipher = ChaCha20Poly1305::new((&key.0).into());
    cipher
        .decrypt(
            Nonce::from_slice(nonce),
            Payload {
                msg: ciphertext,
                aad,
            },
        )
        .map_err(|_| AeadError::Decrypt)
}
