//! Password hashing and verification.
//!
//! Stored passwords are Argon2id descriptors in PHC string format (algorithm
//! marker, parameters, salt and digest, `$`-separated). A record that does not
//! carry the marker is treated as legacy plaintext and compared directly; such
//! records are re-derived into descriptor form on the next write.

use argon2::{
    Algorithm, Argon2, Params, Version,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use base64::{Engine as _, engine::general_purpose};
use rand::RngCore;

use crate::errors::Error;

/// Marker prefix of a hashed password descriptor.
const DESCRIPTOR_PREFIX: &str = "$argon2";

/// Argon2id parameters (RFC 9106 low-memory recommendation).
fn argon2() -> Result<Argon2<'static>, Error> {
    let params = Params::new(19456, 2, 1, None).map_err(|e| Error::Internal {
        operation: format!("create argon2 params: {e}"),
    })?;

    Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
}

/// True when the stored password is already a hash descriptor and must be
/// persisted verbatim rather than re-derived.
pub fn is_descriptor(password: &str) -> bool {
    password.starts_with(DESCRIPTOR_PREFIX)
}

/// Derive a fresh descriptor for a plaintext password with a random salt.
pub fn hash_password(plaintext: &str) -> Result<String, Error> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = argon2()?.hash_password(plaintext.as_bytes(), &salt).map_err(|e| Error::Internal {
        operation: format!("hash password: {e}"),
    })?;

    Ok(hash.to_string())
}

/// Verify a plaintext password against a stored value.
///
/// Descriptor-form passwords are verified with the parameters embedded in the
/// descriptor; anything else is compared as legacy plaintext.
pub fn verify_password(plaintext: &str, stored: &str) -> Result<bool, Error> {
    if !is_descriptor(stored) {
        // Legacy plaintext record, kept for migration.
        return Ok(!stored.is_empty() && stored == plaintext);
    }

    let parsed = PasswordHash::new(stored).map_err(|e| Error::Internal {
        operation: format!("parse password hash: {e}"),
    })?;

    Ok(Argon2::default().verify_password(plaintext.as_bytes(), &parsed).is_ok())
}

/// Generate an opaque session id: 20 random bytes, lowercase hex.
pub fn generate_session_id() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Generate a per-browser anti-forgery token: 16 random bytes, base64url
/// without padding (cookie-safe).
pub fn generate_csrf_token() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_password_hashing() {
        let hash = hash_password("test_password_123").unwrap();

        assert!(is_descriptor(&hash));
        assert!(verify_password("test_password_123", &hash).unwrap());
        assert!(!verify_password("wrong_password", &hash).unwrap());
    }

    #[test]
    fn test_same_input_different_hashes() {
        let hash1 = hash_password("same_password").unwrap();
        let hash2 = hash_password("same_password").unwrap();

        // Different salts, both valid
        assert_ne!(hash1, hash2);
        assert!(verify_password("same_password", &hash1).unwrap());
        assert!(verify_password("same_password", &hash2).unwrap());
    }

    #[test]
    fn test_legacy_plaintext_comparison() {
        assert!(verify_password("hunter2", "hunter2").unwrap());
        assert!(!verify_password("hunter3", "hunter2").unwrap());
        // An empty stored password never authenticates
        assert!(!verify_password("", "").unwrap());
    }

    #[test]
    fn test_session_ids_are_long_and_unique() {
        let id1 = generate_session_id();
        let id2 = generate_session_id();

        assert_eq!(id1.len(), 40); // 20 bytes hex-encoded
        assert_ne!(id1, id2);
        assert!(id1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_csrf_tokens_are_cookie_safe() {
        let token = generate_csrf_token();

        assert_eq!(token.len(), 22); // 16 bytes base64url, no padding
        assert!(!token.contains('='));
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(token, generate_csrf_token());
    }
}
