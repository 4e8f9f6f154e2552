//! AES-256-GCM session cipher.
//!
//! Each session derives one [`Aes256GcmCipher`] from its handshake key
//! material and uses it to encrypt the response (and, symmetrically, to
//! decrypt the `a_block`). A fresh random nonce is generated per call and
//! carried alongside the ciphertext on the wire.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use thiserror::Error;

/// Length of an AES-256-GCM nonce, in bytes.
pub const NONCE_LEN: usize = 12;

/// Errors from symmetric encryption/decryption.
#[derive(Error, Debug)]
pub enum SymmetricError {
    /// The supplied key was not 32 bytes.
    #[error("invalid key length: expected 32 bytes, got {0}")]
    InvalidKeyLength(usize),

    /// Encryption failed.
    #[error("encryption failed")]
    Encryption,

    /// Decryption failed (wrong key, tampered ciphertext, or truncated input).
    #[error("decryption failed")]
    Decryption,
}

/// Result alias for symmetric operations.
pub type SymmetricResult<T> = Result<T, SymmetricError>;

/// Ciphertext plus the nonce used to produce it, in the wire encoding
/// `nonce[12] | ciphertext_and_tag`.
#[derive(Clone)]
pub struct EncryptedData {
    nonce: [u8; NONCE_LEN],
    ciphertext: Vec<u8>,
}

impl EncryptedData {
    /// Serialize as `nonce || ciphertext`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_LEN + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Parse the `nonce || ciphertext` wire encoding.
    pub fn from_bytes(bytes: &[u8]) -> SymmetricResult<Self> {
        if bytes.len() < NONCE_LEN {
            return Err(SymmetricError::Decryption);
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&bytes[..NONCE_LEN]);
        Ok(Self { nonce, ciphertext: bytes[NONCE_LEN..].to_vec() })
    }
}

/// An AES-256-GCM cipher bound to one session key.
pub struct Aes256GcmCipher {
    cipher: Aes256Gcm,
}

impl Aes256GcmCipher {
    /// Build a cipher from a 32-byte key.
    pub fn new(key: &[u8]) -> SymmetricResult<Self> {
        if key.len() != 32 {
            return Err(SymmetricError::InvalidKeyLength(key.len()));
        }
        let key = Key::<Aes256Gcm>::from_slice(key);
        Ok(Self { cipher: Aes256Gcm::new(key) })
    }

    /// Encrypt `plaintext` under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> SymmetricResult<EncryptedData> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| SymmetricError::Encryption)?;

        Ok(EncryptedData { nonce: nonce_bytes, ciphertext })
    }

    /// Decrypt an [`EncryptedData`] produced by [`Aes256GcmCipher::encrypt`].
    pub fn decrypt(&self, data: &EncryptedData) -> SymmetricResult<Vec<u8>> {
        let nonce = Nonce::from_slice(&data.nonce);
        self.cipher
            .decrypt(nonce, data.ciphertext.as_slice())
            .map_err(|_| SymmetricError::Decryption)
    }

    /// Convenience: encrypt and immediately serialize to wire bytes.
    pub fn seal(&self, plaintext: &[u8]) -> SymmetricResult<Vec<u8>> {
        Ok(self.encrypt(plaintext)?.to_bytes())
    }

    /// Convenience: parse wire bytes and immediately decrypt.
    pub fn open(&self, wire: &[u8]) -> SymmetricResult<Vec<u8>> {
        self.decrypt(&EncryptedData::from_bytes(wire)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let key = [7u8; 32];
        let cipher = Aes256GcmCipher::new(&key).unwrap();
        let plaintext = b"a_block payload";

        let sealed = cipher.seal(plaintext).unwrap();
        let opened = cipher.open(&sealed).unwrap();
        assert_eq!(plaintext.to_vec(), opened);
    }

    #[test]
    fn wrong_key_fails() {
        let cipher_a = Aes256GcmCipher::new(&[1u8; 32]).unwrap();
        let cipher_b = Aes256GcmCipher::new(&[2u8; 32]).unwrap();

        let sealed = cipher_a.seal(b"secret").unwrap();
        assert!(cipher_b.open(&sealed).is_err());
    }

    #[test]
    fn rejects_short_key() {
        assert!(Aes256GcmCipher::new(&[0u8; 16]).is_err());
    }

    #[test]
    fn truncated_wire_data_fails_to_parse() {
        assert!(EncryptedData::from_bytes(&[0u8; 4]).is_err());
    }
}
