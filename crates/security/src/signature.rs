//! Webhook body signing — HMAC-SHA256 over the exact request bytes.
//!
//! The signed input is the byte sequence put on the wire; no
//! re-serialization happens after signing. The header value format is
//! `sha256=<lowercase hex of the 32-byte MAC>`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Header name carrying the signature.
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Compute the lowercase hex HMAC-SHA256 of `body` under `secret`.
pub fn sign_body(secret: &str, body: &[u8]) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Full header value: `sha256=<hex digest>`.
pub fn signature_header(secret: &str, body: &[u8]) -> String {
    format!("sha256={}", sign_body(secret, body))
}

/// Verify a signature against the payload using the shared secret.
///
/// Accepts the `sha256=` prefix or a bare hex digest.
/// Uses constant-time comparison to prevent timing attacks.
pub fn verify_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let sig_hex = signature.strip_prefix("sha256=").unwrap_or(signature);

    let provided_bytes = match hex::decode(sig_hex) {
        Ok(b) => b,
        Err(_) => return false, // Invalid hex = reject
    };

    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts any key length");
    mac.update(payload);

    // Constant-time comparison via `verify_slice`
    mac.verify_slice(&provided_bytes).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_verify_roundtrip() {
        let body = br#"{"event":"threat_model.updated"}"#;
        let header = signature_header("s", body);
        assert!(header.starts_with("sha256="));
        assert!(verify_signature("s", body, &header));
    }

    #[test]
    fn bare_hex_digest_verifies() {
        let body = b"payload";
        let digest = sign_body("key", body);
        assert!(verify_signature("key", body, &digest));
    }

    #[test]
    fn tampered_body_fails() {
        let header = signature_header("s", b"original");
        assert!(!verify_signature("s", b"tampered", &header));
    }

    #[test]
    fn wrong_secret_fails() {
        let header = signature_header("s1", b"body");
        assert!(!verify_signature("s2", b"body", &header));
    }

    #[test]
    fn invalid_hex_rejected() {
        assert!(!verify_signature("s", b"body", "sha256=not-hex"));
        assert!(!verify_signature("s", b"body", ""));
    }

    #[test]
    fn digest_is_lowercase_hex_of_32_bytes() {
        let digest = sign_body("secret", b"x");
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, digest.to_lowercase());
    }
}
