//! Cryptographic primitives backing the session handshake and at-rest
//! password storage.
//!
//! - [`asymmetric`]: the server's long-term RSA keypair, used to wrap the
//!   per-session key in the handshake's `r_block`.
//! - [`symmetric`]: AES-256-GCM, used to encrypt the `a_block` and every
//!   response once a session key is established.
//! - [`kdf`]: Argon2id for password hashing, HKDF-SHA256 for expanding the
//!   handshake's raw key material into an AES key.

pub mod asymmetric;
pub mod kdf;
pub mod symmetric;

pub use asymmetric::{AsymmetricError, RsaKeyPair};
pub use kdf::KdfError;
pub use symmetric::{Aes256GcmCipher, SymmetricError};

use thiserror::Error;
use zeroize::Zeroize;

/// Umbrella error for the crypto module, used wherever a caller needs to
/// handle asymmetric, symmetric, and KDF failures uniformly.
#[derive(Error, Debug)]
pub enum CryptoError {
    /// An asymmetric (RSA) operation failed.
    #[error(transparent)]
    Asymmetric(#[from] AsymmetricError),

    /// A symmetric (AES-GCM) operation failed.
    #[error(transparent)]
    Symmetric(#[from] SymmetricError),

    /// A key-derivation operation failed.
    #[error(transparent)]
    Kdf(#[from] KdfError),
}

/// Result alias for crypto-module operations.
pub type CryptoResult<T> = Result<T, CryptoError>;

/// Info string used to domain-separate the HKDF expansion of the handshake
/// key material from any other use of HKDF in this crate.
pub const SESSION_KEY_INFO: &[u8] = b"vaultd-session-key-v1";

/// Derive the AES-256-GCM session cipher from the handshake's raw 48-byte
/// `aes_key` field.
pub fn session_cipher_from_key_material(key_material: &[u8]) -> CryptoResult<Aes256GcmCipher> {
    let mut key = kdf::expand_session_key(key_material, SESSION_KEY_INFO)?;
    let cipher = Aes256GcmCipher::new(&key);
    key.zeroize();
    Ok(cipher?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_cipher_round_trips() {
        let material = [3u8; 48];
        let cipher = session_cipher_from_key_material(&material).unwrap();
        let sealed = cipher.seal(b"hello").unwrap();
        assert_eq!(cipher.open(&sealed).unwrap(), b"hello");
    }
}
