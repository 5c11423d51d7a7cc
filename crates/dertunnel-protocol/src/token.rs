//! Reversible packing of service host, user and token into one opaque string
//!
//! This is obfuscation for copy/paste convenience, not cryptography.

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use thiserror::Error;

/// Tokens up to this length are plain tokens and are never unpacked
pub const PLAIN_TOKEN_MAX_LEN: usize = 24;

const SEPARATOR: char = '#';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("Packed token is not valid base64")]
    InvalidEncoding,

    #[error("Packed token is not valid UTF-8")]
    InvalidUtf8,

    #[error("Packed token must contain service, user and token")]
    MissingFields,
}

/// Components of a connection token
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedToken {
    pub service: String,
    pub user: String,
    pub token: String,
}

/// Pack `service.<base_domain>`, user and token into an opaque string
pub fn pack(base_domain: &str, user: &str, token: &str) -> String {
    let combined = format!("service.{base_domain}{SEPARATOR}{user}{SEPARATOR}{token}");
    let encoded = STANDARD_NO_PAD.encode(combined.as_bytes());
    shuffle(&encoded)
}

/// Inverse of [`pack`]
pub fn unpack(opaque: &str) -> Result<PackedToken, TokenError> {
    let encoded = unshuffle(opaque);
    let decoded = STANDARD_NO_PAD
        .decode(encoded.trim_end_matches('='))
        .map_err(|_| TokenError::InvalidEncoding)?;
    let text = String::from_utf8(decoded).map_err(|_| TokenError::InvalidUtf8)?;

    let mut parts = text.split(SEPARATOR);
    match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(service), Some(user), Some(token), None) => Ok(PackedToken {
            service: service.to_string(),
            user: user.to_string(),
            token: token.to_string(),
        }),
        _ => Err(TokenError::MissingFields),
    }
}

/// Unpack `token` only if it is long enough to be a packed token
///
/// Plain tokens come back with empty service and user.
pub fn unpack_if_packed(token: &str) -> Result<PackedToken, TokenError> {
    if token.len() <= PLAIN_TOKEN_MAX_LEN {
        return Ok(PackedToken {
            service: String::new(),
            user: String::new(),
            token: token.to_string(),
        });
    }
    unpack(token)
}

/// Interleave characters from both halves, starting with the middle
fn shuffle(v: &str) -> String {
    let chars: Vec<char> = v.chars().collect();
    let n = chars.len();
    let half = (n + 1) / 2;
    let mut out = String::with_capacity(v.len());
    for i in (0..half).rev() {
        if let Some(c) = chars.get(half + i) {
            out.push(*c);
        }
        out.push(chars[i]);
    }
    out
}

/// Walk backwards over odd then even positions
fn unshuffle(v: &str) -> String {
    let chars: Vec<char> = v.chars().collect();
    let mut out = String::with_capacity(v.len());
    for start in [chars.len(), chars.len().saturating_sub(1)] {
        let mut i = start;
        while i > 0 {
            out.push(chars[i - 1]);
            i = i.saturating_sub(2);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_known_value() {
        let packed = pack("dummy.foo.com", "user_foo", "p69b5m8067p56nvmbo68nya1");
        assert_eq!(
            packed,
            "QZMfhJlXnZbz4VY3zIbti912mYduu8Z2TbNmw5dSjeNtw1gWTdbk15ISWZOj2lAm3dIyvV92mc"
        );

        let unpacked = unpack(&packed).unwrap();
        assert_eq!(unpacked.service, "service.dummy.foo.com");
        assert_eq!(unpacked.user, "user_foo");
        assert_eq!(unpacked.token, "p69b5m8067p56nvmbo68nya1");
    }

    #[test]
    fn test_shuffle_is_reversible_for_every_length() {
        let source = "abcdefghijklmnopqrstuvwxyz0123456789";
        for len in 0..source.len() {
            let v = &source[..len];
            assert_eq!(unshuffle(&shuffle(v)), v, "length {}", len);
        }
    }

    #[test]
    fn test_round_trip_with_odd_fields() {
        for (domain, user, token) in [
            ("a.io", "bob", "x"),
            ("tunnel.example.com", "user.name-1", "0123456789abcdefghijklmn0123"),
            ("x.y", "ü-user", "tökén"),
        ] {
            let unpacked = unpack(&pack(domain, user, token)).unwrap();
            assert_eq!(unpacked.service, format!("service.{}", domain));
            assert_eq!(unpacked.user, user);
            assert_eq!(unpacked.token, token);
        }
    }

    #[test]
    fn test_plain_tokens_are_not_unpacked() {
        let plain = unpack_if_packed("p69b5m8067p56nvmbo68nya1").unwrap();
        assert_eq!(plain.service, "");
        assert_eq!(plain.user, "");
        assert_eq!(plain.token, "p69b5m8067p56nvmbo68nya1");
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert_eq!(unpack("!!!!not-base64!!!!"), Err(TokenError::InvalidEncoding));

        // valid base64 of "only#two"
        let two_fields = shuffle(&STANDARD_NO_PAD.encode("only#two"));
        assert_eq!(unpack(&two_fields), Err(TokenError::MissingFields));
    }
}
