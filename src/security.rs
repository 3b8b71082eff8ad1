//! Admin authentication
//!
//! Admin routes (balances, credit grants, webhook replay) require
//! `Authorization: Bearer <LEADFLOW_ADMIN_TOKEN>`. The token is kept only as
//! a SHA-256 digest and compared in constant time. With no token configured
//! every admin request is refused.

use sha2::{Digest, Sha256};
use tracing::{debug, warn};

/// Token-based authentication result
#[derive(Debug, Clone, PartialEq)]
pub enum AuthResult {
    /// Authentication successful
    Authenticated,
    /// Authentication failed - missing header
    MissingHeader,
    /// Authentication failed - invalid format
    InvalidFormat,
    /// Authentication failed - invalid token
    InvalidToken,
    /// No admin token configured
    Disabled,
}

impl AuthResult {
    /// Check if authentication was successful
    pub fn is_ok(&self) -> bool {
        matches!(self, AuthResult::Authenticated)
    }

    /// Get HTTP status code for authentication failure
    pub fn status_code(&self) -> u16 {
        match self {
            AuthResult::Authenticated => 200,
            AuthResult::MissingHeader | AuthResult::InvalidFormat | AuthResult::InvalidToken => 401,
            AuthResult::Disabled => 403,
        }
    }

    /// Get error message for authentication failure
    pub fn error_message(&self) -> Option<&'static str> {
        match self {
            AuthResult::Authenticated => None,
            AuthResult::MissingHeader => Some("Missing Authorization header"),
            AuthResult::InvalidFormat => {
                Some("Invalid Authorization format. Expected: Bearer <token>")
            }
            AuthResult::InvalidToken => Some("Invalid token"),
            AuthResult::Disabled => Some("Admin API disabled: no admin token configured"),
        }
    }
}

/// Bearer-token authenticator for admin routes
#[derive(Debug, Clone)]
pub struct AdminAuth {
    token_hash: Option<[u8; 32]>,
}

impl AdminAuth {
    /// Create an authenticator. `None` or an empty token disables admin access.
    pub fn new(token: Option<&str>) -> Self {
        let token_hash = token.filter(|t| !t.is_empty()).map(|t| {
            if t.len() < 32 {
                warn!("SECURITY WARNING: LEADFLOW_ADMIN_TOKEN is less than 32 characters");
            }
            hash_token(t)
        });
        Self { token_hash }
    }

    pub fn is_enabled(&self) -> bool {
        self.token_hash.is_some()
    }

    /// Authenticate a request based on the Authorization header
    pub fn authenticate(&self, auth_header: Option<&str>) -> AuthResult {
        let Some(expected) = &self.token_hash else {
            debug!("Admin request refused: admin API disabled");
            return AuthResult::Disabled;
        };

        let header = match auth_header {
            Some(h) => h,
            None => return AuthResult::MissingHeader,
        };

        let token = match header.strip_prefix("Bearer ") {
            Some(t) => t.trim(),
            None => return AuthResult::InvalidFormat,
        };

        if token.is_empty() {
            return AuthResult::InvalidFormat;
        }

        if constant_time_compare(expected, &hash_token(token)) {
            AuthResult::Authenticated
        } else {
            warn!("Invalid admin token attempt");
            AuthResult::InvalidToken
        }
    }
}

fn hash_token(token: &str) -> [u8; 32] {
    Sha256::digest(token.as_bytes()).into()
}

/// Constant-time byte comparison to prevent timing attacks
fn constant_time_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bearer_token() {
        let auth = AdminAuth::new(Some("admin-token"));
        assert_eq!(auth.authenticate(Some("Bearer admin-token")), AuthResult::Authenticated);
        assert_eq!(auth.authenticate(Some("Bearer wrong")), AuthResult::InvalidToken);
        assert_eq!(auth.authenticate(Some("admin-token")), AuthResult::InvalidFormat);
        assert_eq!(auth.authenticate(Some("Bearer  ")), AuthResult::InvalidFormat);
        assert_eq!(auth.authenticate(None), AuthResult::MissingHeader);
    }

    #[test]
    fn test_disabled_without_token() {
        let auth = AdminAuth::new(None);
        assert!(!auth.is_enabled());
        let result = auth.authenticate(Some("Bearer anything"));
        assert_eq!(result, AuthResult::Disabled);
        assert_eq!(result.status_code(), 403);

        assert!(!AdminAuth::new(Some("")).is_enabled());
    }

    #[test]
    fn test_constant_time_compare() {
        assert!(constant_time_compare(b"abc", b"abc"));
        assert!(!constant_time_compare(b"abc", b"abd"));
        assert!(!constant_time_compare(b"abc", b"ab"));
    }
}
