//! Webhook signature verification.
//!
//! Providers sign the raw request body with HMAC-SHA256 using a shared
//! secret. The header value is lowercase hex, optionally prefixed with
//! `sha256=`. Verification uses the `hmac` crate's constant-time comparison.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::WebhookError;

type HmacSha256 = Hmac<Sha256>;

/// Signature scheme prefix some providers prepend
const SIGNATURE_PREFIX: &str = "sha256=";

/// Parse a signature header value into raw bytes.
///
/// Returns `None` if the value is not valid hex.
pub fn parse_signature_header(header: &str) -> Option<Vec<u8>> {
    let hex_part = header.trim();
    let hex_part = hex_part.strip_prefix(SIGNATURE_PREFIX).unwrap_or(hex_part);
    if hex_part.is_empty() {
        return None;
    }
    hex::decode(hex_part).ok()
}

/// Compute the HMAC-SHA256 of `body` under `secret`
pub fn compute_signature(body: &[u8], secret: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(body);
    mac.finalize().into_bytes().to_vec()
}

/// Format a signature as a header value (`sha256=<hex>`)
pub fn format_signature_header(signature: &[u8]) -> String {
    format!("{SIGNATURE_PREFIX}{}", hex::encode(signature))
}

/// Sign `body` and return the header value a provider would send
pub fn sign(body: &[u8], secret: &[u8]) -> String {
    format_signature_header(&compute_signature(body, secret))
}

/// Verify a signature header against the body.
pub fn verify_signature(body: &[u8], header: &str, secret: &[u8]) -> bool {
    let Some(expected) = parse_signature_header(header) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

/// Verifier bound to a configured secret and header name.
///
/// With no secret configured every request passes; this is only meant for
/// local development and is logged loudly at startup.
#[derive(Debug, Clone)]
pub struct SignatureVerifier {
    secret: Option<Vec<u8>>,
    header: String,
}

impl SignatureVerifier {
    /// Create a verifier. An empty secret disables verification.
    pub fn new(secret: Option<String>, header: impl Into<String>) -> Self {
        Self {
            secret: secret
                .filter(|s| !s.is_empty())
                .map(String::into_bytes),
            header: header.into().to_ascii_lowercase(),
        }
    }

    /// Whether requests are actually checked
    pub fn is_enabled(&self) -> bool {
        self.secret.is_some()
    }

    /// Header the signature is read from (lowercase)
    pub fn header_name(&self) -> &str {
        &self.header
    }

    /// Check a request body against the header value it arrived with
    pub fn verify(&self, body: &[u8], header_value: Option<&str>) -> Result<(), WebhookError> {
        let Some(secret) = &self.secret else {
            return Ok(());
        };
        let header_value =
            header_value.ok_or_else(|| WebhookError::MissingSignature(self.header.clone()))?;
        if verify_signature(body, header_value, secret) {
            Ok(())
        } else {
            Err(WebhookError::InvalidSignature)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_parse_with_and_without_prefix() {
        assert_eq!(parse_signature_header("sha256=abcd"), Some(vec![0xab, 0xcd]));
        assert_eq!(parse_signature_header("abcd"), Some(vec![0xab, 0xcd]));
        assert_eq!(parse_signature_header("sha256="), None);
        assert_eq!(parse_signature_header("sha256=zz"), None);
    }

    #[test]
    fn test_verify_roundtrip() {
        let body = br#"{"event":"message.sent"}"#;
        let header = sign(body, b"secret");
        assert!(verify_signature(body, &header, b"secret"));
        assert!(verify_signature(body, header.trim_start_matches("sha256="), b"secret"));
    }

    #[test]
    fn test_tampered_body_fails() {
        let header = sign(b"original", b"secret");
        assert!(!verify_signature(b"tampered", &header, b"secret"));
        assert!(!verify_signature(b"original", &header, b"other"));
    }

    #[test]
    fn test_verifier_disabled_without_secret() {
        let verifier = SignatureVerifier::new(None, "X-Webhook-Signature");
        assert!(!verifier.is_enabled());
        assert!(verifier.verify(b"anything", None).is_ok());

        let verifier = SignatureVerifier::new(Some(String::new()), "x");
        assert!(!verifier.is_enabled());
    }

    #[test]
    fn test_verifier_requires_header() {
        let verifier = SignatureVerifier::new(Some("s3cret".into()), "X-Webhook-Signature");
        assert_eq!(verifier.header_name(), "x-webhook-signature");
        assert!(matches!(
            verifier.verify(b"{}", None),
            Err(WebhookError::MissingSignature(_))
        ));
        assert!(matches!(
            verifier.verify(b"{}", Some("sha256=00")),
            Err(WebhookError::InvalidSignature)
        ));
        let good = sign(b"{}", b"s3cret");
        assert!(verifier.verify(b"{}", Some(&good)).is_ok());
    }

    proptest! {
        #[test]
        fn prop_signed_bodies_verify(
            body in proptest::collection::vec(any::<u8>(), 0..256),
            secret in proptest::collection::vec(any::<u8>(), 1..64),
        ) {
            let header = sign(&body, &secret);
            prop_assert!(verify_signature(&body, &header, &secret));
        }

        #[test]
        fn prop_flipped_byte_fails(
            body in proptest::collection::vec(any::<u8>(), 1..256),
            idx in any::<prop::sample::Index>(),
        ) {
            let header = sign(&body, b"k");
            let mut tampered = body.clone();
            let i = idx.index(tampered.len());
            tampered[i] ^= 0x01;
            prop_assert!(!verify_signature(&tampered, &header, b"k"));
        }
    }
}
