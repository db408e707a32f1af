//! Password hashing and policy.

use anyhow::{Result, anyhow};
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;

pub const MIN_PASSWORD_LEN: usize = 8;

/// Hash a password with Argon2id and a fresh salt.
///
/// # Errors
/// Returns an error if hashing fails.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| anyhow!("password hashing failed: {e}"))
}

/// Constant-time verification against a stored PHC-format hash. A malformed
/// stored hash verifies as false rather than erroring, so a corrupt row reads
/// as bad credentials instead of a 500.
#[must_use]
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    PasswordHash::new(stored_hash)
        .map(|hash| {
            Argon2::default()
                .verify_password(password.as_bytes(), &hash)
                .is_ok()
        })
        .unwrap_or(false)
}

/// Minimum-strength check, returning a user-facing message on failure.
#[must_use]
pub fn password_policy_error(password: &str) -> Option<String> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Some(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters"
        ));
    }
    if !password.chars().any(char::is_alphabetic) || !password.chars().any(|c| c.is_ascii_digit()) {
        return Some("Password must contain both letters and numbers".to_string());
    }
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn hash_and_verify_roundtrip() {
        let hash = hash_password("Abcd1234!").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("Abcd1234!", &hash));
        assert!(!verify_password("abcd1234!", &hash));
    }

    #[test]
    fn hashes_are_salted() {
        let a = hash_password("Abcd1234!").unwrap();
        let b = hash_password("Abcd1234!").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn malformed_stored_hash_reads_as_mismatch() {
        assert!(!verify_password("Abcd1234!", "not-a-phc-hash"));
        assert!(!verify_password("Abcd1234!", ""));
    }

    #[test]
    fn policy_rejects_weak_passwords() {
        assert!(password_policy_error("Abc123").is_some());
        assert!(password_policy_error("onlyletters").is_some());
        assert!(password_policy_error("12345678").is_some());
        assert!(password_policy_error("Abcd1234!").is_none());
    }
}
