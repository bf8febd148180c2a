//! Account passwords: the length rule for new passwords and Argon2id PHC
//! hashing. The salt lives inside the PHC string.

use anyhow::anyhow;
use argon2::{
    password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::rngs::OsRng;
use tracing::error;

/// Shortest password accepted at registration, profile edit and reset.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Length is counted in characters, not bytes.
pub fn meets_policy(candidate: &str) -> bool {
    candidate.chars().count() >= MIN_PASSWORD_LEN
}

pub fn hash_password(plain: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(plain.as_bytes(), &salt)
        .map(|phc| phc.to_string())
        .map_err(|e| {
            error!(error = %e, "argon2 hash failed");
            anyhow!("hash password: {e}")
        })
}

/// `Ok(false)` only for a wrong password. A stored hash that cannot be parsed
/// or checked is an error, since that account cannot authenticate at all.
pub fn verify_password(plain: &str, stored: &str) -> anyhow::Result<bool> {
    let parsed = PasswordHash::new(stored).map_err(|e| {
        error!(error = %e, "stored password hash is malformed");
        anyhow!("malformed password hash: {e}")
    })?;
    match Argon2::default().verify_password(plain.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(password_hash::Error::Password) => Ok(false),
        Err(e) => {
            error!(error = %e, "argon2 verify failed");
            Err(anyhow!("verify password: {e}"))
        }
    }
}
