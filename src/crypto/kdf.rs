//! Key derivation: Argon2id for password hashing, HKDF-SHA256 for expanding
//! the handshake's raw key material into an AES-256-GCM key.
//!
//! Password hashes are stored as a self-describing byte blob (Argon2
//! parameters + salt + digest, all fixed-width), so the on-disk
//! `AUTHAUTH`/`AUTHDIFF` hash field — already length-prefixed and
//! variable-width — needs no format change to carry them.

use argon2::{Algorithm, Argon2, Params, Version};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use thiserror::Error;

const SALT_LEN: usize = 16;
const HASH_LEN: usize = 32;
/// Length of the serialized hash blob: 3 `u32` params + salt + digest.
const BLOB_LEN: usize = 4 + 4 + 4 + SALT_LEN + HASH_LEN;

/// Default Argon2id tuning: 64 MiB memory, 3 iterations, 4-way parallelism.
const DEFAULT_MEMORY_COST: u32 = 65536;
const DEFAULT_TIME_COST: u32 = 3;
const DEFAULT_PARALLELISM: u32 = 4;

/// Errors from password hashing/verification or HKDF expansion.
#[derive(Error, Debug)]
pub enum KdfError {
    /// Argon2id hashing failed.
    #[error("password hashing failed: {0}")]
    HashingFailed(String),

    /// The stored hash blob was not the expected length/shape.
    #[error("stored password hash is malformed")]
    MalformedHash,

    /// HKDF expansion failed (requested output too long for the hash).
    #[error("HKDF expansion failed: {0}")]
    ExpansionFailed(String),
}

/// Result alias for KDF operations.
pub type KdfResult<T> = Result<T, KdfError>;

fn argon2_with_params(m: u32, t: u32, p: u32) -> KdfResult<Argon2<'static>> {
    let params = Params::new(m, t, p, Some(HASH_LEN))
        .map_err(|e| KdfError::HashingFailed(e.to_string()))?;
    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// Hash a password with Argon2id, returning a fixed-shape byte blob suitable
/// for storage in the auth table's `pass_hash` field.
pub fn hash_password(password: &[u8]) -> KdfResult<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);

    let argon2 = argon2_with_params(DEFAULT_MEMORY_COST, DEFAULT_TIME_COST, DEFAULT_PARALLELISM)?;
    let mut digest = [0u8; HASH_LEN];
    argon2
        .hash_password_into(password, &salt, &mut digest)
        .map_err(|e| KdfError::HashingFailed(e.to_string()))?;

    let mut blob = Vec::with_capacity(BLOB_LEN);
    blob.extend_from_slice(&DEFAULT_MEMORY_COST.to_le_bytes());
    blob.extend_from_slice(&DEFAULT_TIME_COST.to_le_bytes());
    blob.extend_from_slice(&DEFAULT_PARALLELISM.to_le_bytes());
    blob.extend_from_slice(&salt);
    blob.extend_from_slice(&digest);
    Ok(blob)
}

/// Verify a password against a stored hash blob produced by [`hash_password`].
pub fn verify_password(password: &[u8], stored_hash: &[u8]) -> KdfResult<bool> {
    if stored_hash.len() != BLOB_LEN {
        return Err(KdfError::MalformedHash);
    }

    let m = u32::from_le_bytes(stored_hash[0..4].try_into().unwrap());
    let t = u32::from_le_bytes(stored_hash[4..8].try_into().unwrap());
    let p = u32::from_le_bytes(stored_hash[8..12].try_into().unwrap());
    let salt = &stored_hash[12..12 + SALT_LEN];
    let expected_digest = &stored_hash[12 + SALT_LEN..];

    let argon2 = argon2_with_params(m, t, p)?;
    let mut digest = [0u8; HASH_LEN];
    argon2
        .hash_password_into(password, salt, &mut digest)
        .map_err(|e| KdfError::HashingFailed(e.to_string()))?;

    Ok(constant_time_eq(&digest, expected_digest))
}

/// Compare two equal-length byte slices without short-circuiting on the
/// first mismatch.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Expand the handshake's raw `aes_key[48]` material into a 32-byte
/// AES-256-GCM key via HKDF-SHA256.
pub fn expand_session_key(key_material: &[u8], info: &[u8]) -> KdfResult<[u8; 32]> {
    let hkdf = Hkdf::<Sha256>::new(None, key_material);
    let mut out = [0u8; 32];
    hkdf.expand(info, &mut out)
        .map_err(|e| KdfError::ExpansionFailed(e.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_round_trip() {
        let hash = hash_password(b"correct horse battery staple").unwrap();
        assert!(verify_password(b"correct horse battery staple", &hash).unwrap());
        assert!(!verify_password(b"wrong password", &hash).unwrap());
    }

    #[test]
    fn hashes_are_salted() {
        let h1 = hash_password(b"same password").unwrap();
        let h2 = hash_password(b"same password").unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn malformed_hash_is_rejected() {
        assert!(verify_password(b"x", b"too short").is_err());
    }

    #[test]
    fn session_key_expansion_is_deterministic() {
        let material = [9u8; 48];
        let k1 = expand_session_key(&material, b"vaultd-session").unwrap();
        let k2 = expand_session_key(&material, b"vaultd-session").unwrap();
        assert_eq!(k1, k2);
    }

    #[test]
    fn different_info_gives_different_keys() {
        let material = [9u8; 48];
        let k1 = expand_session_key(&material, b"a").unwrap();
        let k2 = expand_session_key(&material, b"b").unwrap();
        assert_ne!(k1, k2);
    }
}
