//! RSA-OAEP keypair management: generation, PEM (de)serialization, and the
//! raw encrypt/decrypt primitives used to wrap/unwrap the session handshake's
//! `r_block`.

use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use thiserror::Error;

/// Bit length used for the server's long-term keypair.
pub const RSA_KEY_BITS: usize = 2048;

/// Errors from RSA key generation, PEM encoding, or OAEP encrypt/decrypt.
#[derive(Error, Debug)]
pub enum AsymmetricError {
    /// Key generation failed (RNG exhaustion or invalid parameters).
    #[error("RSA key generation failed: {0}")]
    KeyGeneration(String),

    /// PEM encode/decode failed.
    #[error("PEM encoding error: {0}")]
    Pem(String),

    /// OAEP encryption failed (oversized plaintext for the key modulus).
    #[error("RSA encryption failed: {0}")]
    Encryption(String),

    /// OAEP decryption failed (corrupt ciphertext or wrong key).
    #[error("RSA decryption failed: {0}")]
    Decryption(String),
}

/// Result alias for asymmetric operations.
pub type AsymmetricResult<T> = Result<T, AsymmetricError>;

/// An RSA keypair used for the server's long-term identity.
///
/// `Debug` is intentionally not derived with the private key in scope —
/// the key is never logged.
pub struct RsaKeyPair {
    private_key: RsaPrivateKey,
    public_key: RsaPublicKey,
}

impl RsaKeyPair {
    /// Generate a fresh keypair.
    pub fn generate() -> AsymmetricResult<Self> {
        let mut rng = rand::thread_rng();
        let private_key = RsaPrivateKey::new(&mut rng, RSA_KEY_BITS)
            .map_err(|e| AsymmetricError::KeyGeneration(e.to_string()))?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(Self { private_key, public_key })
    }

    /// Load a keypair from a PKCS#1 PEM-encoded private key.
    pub fn from_private_pem(pem: &str) -> AsymmetricResult<Self> {
        let private_key = RsaPrivateKey::from_pkcs1_pem(pem)
            .map_err(|e| AsymmetricError::Pem(e.to_string()))?;
        let public_key = RsaPublicKey::from(&private_key);
        Ok(Self { private_key, public_key })
    }

    /// Encode the private key as PKCS#1 PEM, for persisting across restarts.
    pub fn private_key_to_pem(&self) -> AsymmetricResult<String> {
        self.private_key
            .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
            .map(|s| s.to_string())
            .map_err(|e| AsymmetricError::Pem(e.to_string()))
    }

    /// Encode the public key as PKCS#1 PEM, for the `KEY` handshake response.
    pub fn public_key_to_pem(&self) -> AsymmetricResult<String> {
        self.public_key
            .to_pkcs1_pem(rsa::pkcs1::LineEnding::LF)
            .map_err(|e| AsymmetricError::Pem(e.to_string()))
    }

    /// Decrypt an OAEP-SHA256 ciphertext with the private key.
    ///
    /// Used to unwrap the client's `r_block`.
    pub fn decrypt(&self, ciphertext: &[u8]) -> AsymmetricResult<Vec<u8>> {
        let padding = Oaep::new::<Sha256>();
        self.private_key
            .decrypt(padding, ciphertext)
            .map_err(|e| AsymmetricError::Decryption(e.to_string()))
    }

    /// Encrypt a plaintext under the public key with OAEP-SHA256.
    ///
    /// Used client-side in tests to build a valid `r_block`.
    pub fn encrypt(&self, plaintext: &[u8]) -> AsymmetricResult<Vec<u8>> {
        let mut rng = rand::thread_rng();
        let padding = Oaep::new::<Sha256>();
        self.public_key
            .encrypt(&mut rng, padding, plaintext)
            .map_err(|e| AsymmetricError::Encryption(e.to_string()))
    }
}

impl std::fmt::Debug for RsaKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RsaKeyPair")
            .field("private_key", &"[REDACTED]")
            .field("public_key", &"RsaPublicKey")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_encrypt_decrypt() {
        let keypair = RsaKeyPair::generate().unwrap();
        let plaintext = vec![0u8; LEN_RBLOCK_TEST];
        let ciphertext = keypair.encrypt(&plaintext).unwrap();
        let decrypted = keypair.decrypt(&ciphertext).unwrap();
        assert_eq!(plaintext, decrypted);
    }

    const LEN_RBLOCK_TEST: usize = 128;

    #[test]
    fn pem_round_trip_preserves_key() {
        let keypair = RsaKeyPair::generate().unwrap();
        let pem = keypair.private_key_to_pem().unwrap();
        let reloaded = RsaKeyPair::from_private_pem(&pem).unwrap();

        let plaintext = b"round trip through PEM";
        let ciphertext = keypair.encrypt(plaintext).unwrap();
        let decrypted = reloaded.decrypt(&ciphertext).unwrap();
        assert_eq!(plaintext.to_vec(), decrypted);
    }

    #[test]
    fn debug_never_exposes_private_key() {
        let keypair = RsaKeyPair::generate().unwrap();
        let debug_str = format!("{:?}", keypair);
        assert!(debug_str.contains("REDACTED"));
    }
}
