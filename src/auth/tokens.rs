//! One-time secrets mailed to the user: the 6-digit email verification code and
//! the password reset token. Only their SHA-256 digests are persisted.

use rand::{distributions::Uniform, rngs::OsRng, Rng, RngCore};
use sha2::{Digest, Sha256};
use time::{Duration, OffsetDateTime};

/// Both the verification code and the reset token live this long.
pub const ONE_TIME_TTL: Duration = Duration::minutes(10);

const RESET_TOKEN_BYTES: usize = 20;

/// A freshly issued secret. `raw` goes into the email, `hash` into the store.
#[derive(Debug, Clone)]
pub struct OneTimeSecret {
    pub raw: String,
    pub hash: String,
    pub expires_at: OffsetDateTime,
}

pub fn new_verification_code(now: OffsetDateTime) -> OneTimeSecret {
    let code = OsRng.sample(Uniform::new_inclusive(100_000u32, 999_999u32));
    issue(code.to_string(), now)
}

/// 160 random bits, hex encoded.
pub fn new_reset_token(now: OffsetDateTime) -> OneTimeSecret {
    let mut bytes = [0u8; RESET_TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    issue(hex::encode(bytes), now)
}

pub fn hash_secret(raw: &str) -> String {
    hex::encode(Sha256::digest(raw.as_bytes()))
}

/// Matches a submitted secret against the stored digest and expiry.
/// An expiry equal to `now` counts as expired.
pub fn matches(
    submitted: &str,
    stored_hash: Option<&str>,
    expires_at: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> bool {
    match (stored_hash, expires_at) {
        (Some(stored), Some(exp)) => exp > now && hash_secret(submitted) == stored,
        _ => false,
    }
}

fn issue(raw: String, now: OffsetDateTime) -> OneTimeSecret {
    OneTimeSecret {
        hash: hash_secret(&raw),
        raw,
        expires_at: now + ONE_TIME_TTL,
    }
}
