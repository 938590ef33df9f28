//! Password hashing and verification using bcrypt.

use crate::error::AuthError;

/// Lowest accepted bcrypt work factor.
pub const MIN_BCRYPT_COST: u32 = 10;

/// bcrypt only looks at the first 72 bytes.
const MAX_PASSWORD_BYTES: usize = 72;

/// Hash a password. `cost` is raised to [`MIN_BCRYPT_COST`] when lower.
///
/// Passwords longer than 72 bytes are rejected instead of silently
/// truncated.
pub fn hash_password(password: &str, cost: u32) -> Result<String, AuthError> {
    bcrypt::non_truncating_hash(password, cost.max(MIN_BCRYPT_COST)).map_err(|e| match e {
        bcrypt::BcryptError::Truncation(len) => AuthError::WeakPassword(format!(
            "password is {len} bytes, at most {MAX_PASSWORD_BYTES} are allowed"
        )),
        other => AuthError::Crypto(format!("bcrypt hash: {other}")),
    })
}

/// Verify a plaintext password against a bcrypt hash.
///
/// Returns `Ok(true)` on match, `Ok(false)` on mismatch, or
/// `Err(AuthError::Crypto)` if the stored hash is malformed.
pub fn verify_password(password: &str, hash: &str) -> Result<bool, AuthError> {
    bcrypt::verify(password, hash).map_err(|e| AuthError::Crypto(format!("bcrypt verify: {e}")))
}

/// Check a new password against the length policy before hashing.
pub fn check_policy(password: &str, min_length: usize) -> Result<(), AuthError> {
    let chars = password.chars().count();
    if chars < min_length {
        return Err(AuthError::WeakPassword(format!(
            "password must be at least {min_length} characters"
        )));
    }
    if password.len() > MAX_PASSWORD_BYTES {
        return Err(AuthError::WeakPassword(format!(
            "password must be at most {MAX_PASSWORD_BYTES} bytes"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn correct_password_matches() {
        let hash = hash_password("s3cret!", MIN_BCRYPT_COST).unwrap();
        assert!(verify_password("s3cret!", &hash).unwrap());
    }

    #[test]
    fn wrong_password_does_not_match() {
        let hash = hash_password("s3cret!", MIN_BCRYPT_COST).unwrap();
        assert!(!verify_password("wrong", &hash).unwrap());
    }

    #[test]
    fn cost_is_clamped_to_minimum() {
        let hash = hash_password("pw-123456", 4).unwrap();
        // $2b$10$...
        assert_eq!(&hash[4..6], "10");
    }

    #[test]
    fn malformed_hash_returns_error() {
        assert!(verify_password("pw", "not-a-hash").is_err());
    }

    #[test]
    fn overlong_password_is_rejected() {
        let long = "x".repeat(73);
        assert!(matches!(
            hash_password(&long, MIN_BCRYPT_COST),
            Err(AuthError::WeakPassword(_))
        ));
        assert!(check_policy(&long, 6).is_err());
    }

    #[test]
    fn short_password_fails_policy() {
        assert!(check_policy("abc", 6).is_err());
        assert!(check_policy("abcdef", 6).is_ok());
    }
}
