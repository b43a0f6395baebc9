//! MD5-based password-response digest utilities.
//!
//! The MD5 compression function itself is consumed from the `md-5`
//! crate; everything here is the protocol-specific framing around it.

use md5::{Digest, Md5};

/// Computes the raw 16-byte MD5 digest of `bytes`.
pub fn digest(bytes: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Formats a `u32` as an 8-character lowercase hex string, big-endian
/// byte order (i.e. the natural decimal-to-hex reading of the value).
pub fn hex32_be(value: u32) -> String {
    format!("{value:08x}")
}

/// Parses an 8-character hex string produced by [`hex32_be`] back into
/// a `u32`. Returns `None` on malformed input.
pub fn from_hex32(s: &str) -> Option<u32> {
    u32::from_str_radix(s, 16).ok()
}

/// Formats a 16-byte digest as a 32-character uppercase hex string.
pub fn digest_to_hex_uppercase(digest: &[u8; 16]) -> String {
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{byte:02X}"));
    }
    out
}

/// Formats a 16-byte digest as a 32-character lowercase hex string
/// (used for the registration reporter's `d=` parameter).
pub fn digest_to_hex_lowercase(digest: &[u8; 16]) -> String {
    let mut out = String::with_capacity(32);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Uppercases ASCII lowercase letters only (`'a'..='z'`), leaving every
/// other byte (digits, punctuation, non-ASCII) untouched. Password
/// canonicalization needs exactly this, not a locale-aware
/// `to_uppercase`.
pub fn ascii_uppercase(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_lowercase() { c.to_ascii_uppercase() } else { c })
        .collect()
}

/// Computes the expected password-response digest for a given
/// `password` and `nonce`: `MD5(uppercase(password) || hex32_be(nonce))`.
pub fn password_response(password: &str, nonce: u32) -> [u8; 16] {
    let mut input = ascii_uppercase(password).into_bytes();
    input.extend_from_slice(hex32_be(nonce).as_bytes());
    digest(&input)
}

/// Verifies a 16-byte response against the expected digest for
/// `password`/`nonce`, byte-for-byte.
pub fn verify_password_response(password: &str, nonce: u32, response: &[u8]) -> bool {
    response.len() == 16 && response == password_response(password, nonce)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex32_round_trips() {
        for v in [0u32, 1, 0xdead_beef, u32::MAX, 0x0000_00ff] {
            let hex = hex32_be(v);
            assert_eq!(hex.len(), 8);
            assert_eq!(from_hex32(&hex), Some(v));
        }
    }

    #[test]
    fn uppercase_is_ascii_only() {
        assert_eq!(ascii_uppercase("PUBLIC"), "PUBLIC");
        assert_eq!(ascii_uppercase("public"), "PUBLIC");
        assert_eq!(ascii_uppercase("mix3d-Case!"), "MIX3D-CASE!");
    }

    #[test]
    fn verify_matches_only_correct_password() {
        let nonce = 0x1234_5678;
        let response = password_response("PUBLIC", nonce);
        assert!(verify_password_response("PUBLIC", nonce, &response));
        assert!(verify_password_response("public", nonce, &response));
        assert!(!verify_password_response("WRONG", nonce, &response));
    }

    #[test]
    fn verify_rejects_wrong_length() {
        assert!(!verify_password_response("PUBLIC", 1, &[0u8; 15]));
    }

    #[test]
    fn digest_hex_case_matches_lowercase_uppercase() {
        let d = digest(b"PUBLIC00000001");
        let lower = digest_to_hex_lowercase(&d);
        let upper = digest_to_hex_uppercase(&d);
        assert_eq!(lower.len(), 32);
        assert_eq!(upper.len(), 32);
        assert_eq!(lower.to_uppercase(), upper);
        assert_eq!(upper.to_lowercase(), lower);
    }
}
