//! Client token generation and salted token hashes
//!
//! Hashes are stored as `salt:base64(sha256(salt || token))`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

const TOKEN_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Length of generated client tokens
pub const TOKEN_LEN: usize = 24;

const SALT_LEN: usize = 32;

/// Shortest stored hash accepted from configuration
pub const MIN_TOKEN_HASH_LEN: usize = 48;

/// Random string over `[0-9a-z]`
pub fn generate_token_of_len(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| TOKEN_ALPHABET[rng.gen_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

/// Fresh client token
pub fn generate_token() -> String {
    generate_token_of_len(TOKEN_LEN)
}

fn digest(salt: &str, token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(token.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// Salted hash of `token` for storage in the clients list
pub fn hash_token(token: &str) -> String {
    let salt = generate_token_of_len(SALT_LEN);
    let hashed = digest(&salt, token);
    format!("{salt}:{hashed}")
}

/// Check `token` against a stored hash
pub fn verify_token(hash: &str, token: &str) -> bool {
    let Some((salt, expected)) = hash.split_once(':') else {
        return false;
    };
    safe_equals(digest(salt, token).as_bytes(), expected.as_bytes())
}

/// Length is not secret; the contents are compared in constant time
fn safe_equals(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && bool::from(a.ct_eq(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_tokens() {
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase()));
        assert_ne!(generate_token(), token);
    }

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_token("p69b5m8067p56nvmbo68nya1");
        assert!(hash.len() >= MIN_TOKEN_HASH_LEN);
        assert!(verify_token(&hash, "p69b5m8067p56nvmbo68nya1"));
        assert!(!verify_token(&hash, "p69b5m8067p56nvmbo68nya2"));
        assert!(!verify_token(&hash, ""));

        // same token, different salt
        assert_ne!(hash_token("abc"), hash_token("abc"));
    }

    #[test]
    fn test_malformed_hash() {
        assert!(!verify_token("no-separator", "token"));
        assert!(!verify_token("salt:", "token"));
    }

    #[test]
    fn test_safe_equals() {
        assert!(safe_equals(b"abc", b"abc"));
        assert!(!safe_equals(b"abc", b"abd"));
        assert!(!safe_equals(b"abc", b"abcd"));
        assert!(!safe_equals(b"", b"a"));
        assert!(safe_equals(b"", b""));
    }

    #[test]
    fn test_verify_rejects_truncated_digest() {
        let hash = hash_token("abc");
        let truncated = &hash[..hash.len() - 1];
        assert!(!verify_token(truncated, "abc"));
    }
}
