//! Error types for Leadflow Core
//!
//! This module provides the error hierarchy using `thiserror`. Each subsystem
//! (ledger, storage, webhooks, metered actions, configuration) owns its own
//! enum, and errors convert upwards with `#[from]`.
//!
//! Business outcomes are deliberately NOT errors: an insufficient balance is a
//! `false` from the quota consumer and a duplicate webhook is `is_new = false`
//! from the deduplicator. Only the metered-action orchestrator lifts the former
//! into [`MeteredActionError::InsufficientCredits`] because it has to stop the
//! external call.

use thiserror::Error;

use crate::ledger::CreditKind;

/// Storage backend errors.
///
/// These are infrastructure failures: the store could not be reached or
/// returned something it should never contain.
#[derive(Error, Debug)]
pub enum StoreError {
    /// SQLite driver error
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Blocking task panicked or was cancelled
    #[error("store task join error: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// A referenced row does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// A row holds a value the code cannot interpret
    #[error("corrupt row: {0}")]
    Corrupt(String),

    /// A credit would push the balance past the storable maximum
    #[error("balance overflow for tenant {tenant} ({kind})")]
    BalanceOverflow {
        /// Tenant whose balance overflowed
        tenant: String,
        /// Credit kind
        kind: CreditKind,
    },
}

/// Ledger (quota consumer) errors
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Amount was zero or too large to store
    #[error("Invalid amount: {0} (must be between 1 and {max})", max = i64::MAX)]
    InvalidAmount(u64),

    /// Idempotency token was empty
    #[error("Idempotency token must not be empty")]
    EmptyToken,

    /// Tenant identifier was empty
    #[error("Tenant id must not be empty")]
    EmptyTenant,

    /// Underlying store failed
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl LedgerError {
    /// Whether this error is an infrastructure failure rather than bad input
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, Self::Store(_))
    }
}

/// Webhook ingestion errors
#[derive(Error, Debug)]
pub enum WebhookError {
    /// Signature header absent while a secret is configured
    #[error("Missing signature header: {0}")]
    MissingSignature(String),

    /// Signature did not verify
    #[error("Invalid webhook signature")]
    InvalidSignature,

    /// Body was not a JSON object we could read
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Envelope carried no event type under any known field name
    #[error("Missing event type")]
    MissingEventType,
}

/// Metered action errors
#[derive(Error, Debug)]
pub enum MeteredActionError {
    /// Not enough credits; no external call was made
    #[error("Insufficient {kind} credits: {required} required")]
    InsufficientCredits {
        /// Credit kind that was short
        kind: CreditKind,
        /// Amount the action needed
        required: u64,
    },

    /// External call failed (or timed out) and the debit was rolled back
    #[error("External call failed: {message}")]
    External {
        /// Error reported by the external system
        message: String,
        /// Token shared by the debit and its rollback
        token: String,
    },

    /// External call failed AND the rollback credit could not be written.
    /// Credits are out of sync until an operator intervenes.
    #[error("Rollback failed for token {token}: {rollback} (external error: {external})")]
    RollbackFailed {
        /// Token of the orphaned debit
        token: String,
        /// Original external error
        external: String,
        /// Error from the last rollback attempt
        rollback: String,
    },

    /// Ledger rejected the request or the store was unreachable
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Environment variable had an unparseable value
    #[error("Invalid value for {var}: {message}")]
    InvalidValue {
        /// Variable name
        var: String,
        /// Parse error
        message: String,
    },

    /// URL could not be parsed
    #[error("Invalid URL for {var}: {source}")]
    InvalidUrl {
        /// Variable name
        var: String,
        /// Parse error
        #[source]
        source: url::ParseError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_amount_display() {
        let err = LedgerError::InvalidAmount(0);
        assert!(err.to_string().contains("Invalid amount"));
        assert!(err.to_string().contains('0'));
    }

    #[test]
    fn test_insufficient_credits_message() {
        let err = MeteredActionError::InsufficientCredits {
            kind: CreditKind::LeadSearch,
            required: 20,
        };
        assert_eq!(err.to_string(), "Insufficient lead_search credits: 20 required");
    }

    #[test]
    fn test_store_error_is_infrastructure() {
        let err = LedgerError::Store(StoreError::NotFound("x".to_string()));
        assert!(err.is_infrastructure());
        assert!(!LedgerError::EmptyToken.is_infrastructure());
    }

    #[test]
    fn test_webhook_error() {
        let err = WebhookError::MissingSignature("x-webhook-signature".to_string());
        assert!(err.to_string().contains("x-webhook-signature"));
    }
}
