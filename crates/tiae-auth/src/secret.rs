//! Random credential generation.
//!
//! All values come from the thread-local CSPRNG. Alphabets are explicit;
//! nothing is derived from time or process state.

use rand::Rng;

/// Alphabet of access keys: uppercase letters and digits.
pub const ACCESS_KEY_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Alphabet of secret keys: letters, digits, `+` and `/`.
pub const SECRET_KEY_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";

pub const ACCESS_KEY_LEN: usize = 16;
pub const SECRET_KEY_LEN: usize = 32;

fn random_from(alphabet: &[u8], len: usize) -> String {
    let mut rng = rand::rng();
    (0..len)
        .map(|_| alphabet[rng.random_range(0..alphabet.len())] as char)
        .collect()
}

/// 16 characters from [`ACCESS_KEY_ALPHABET`].
pub fn generate_access_key() -> String {
    random_from(ACCESS_KEY_ALPHABET, ACCESS_KEY_LEN)
}

/// 32 characters from [`SECRET_KEY_ALPHABET`].
pub fn generate_secret_key() -> String {
    random_from(SECRET_KEY_ALPHABET, SECRET_KEY_LEN)
}

/// A matching access/secret key pair.
pub fn generate_credentials() -> (String, String) {
    (generate_access_key(), generate_secret_key())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_key_shape() {
        for _ in 0..100 {
            let key = generate_access_key();
            assert_eq!(key.len(), 16);
            assert!(key.bytes().all(|b| ACCESS_KEY_ALPHABET.contains(&b)), "{key}");
        }
    }

    #[test]
    fn secret_key_shape() {
        for _ in 0..100 {
            let key = generate_secret_key();
            assert_eq!(key.len(), 32);
            assert!(key.bytes().all(|b| SECRET_KEY_ALPHABET.contains(&b)), "{key}");
        }
    }

    #[test]
    fn keys_are_not_repeated() {
        let (a1, s1) = generate_credentials();
        let (a2, s2) = generate_credentials();
        assert_ne!(a1, a2);
        assert_ne!(s1, s2);
    }
}
