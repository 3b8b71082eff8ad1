//! Quota consumer: the only way credits move.
//!
//! Wraps a [`LedgerStore`] with input validation and logging. `debit` and
//! `credit` are idempotent on `(tenant, kind, token)` per direction, so a
//! rollback credit that reuses the debit's token can be retried forever and
//! still refunds exactly once.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::error::LedgerError;
use crate::ledger::store::LedgerStore;
use crate::ledger::types::{
    CreditBalance, CreditKind, Direction, IdempotencyToken, LedgerEntry, LedgerMutation,
    MutationOutcome, TenantId,
};

/// Atomic, idempotent debit/credit operations over a ledger store
#[derive(Clone)]
pub struct QuotaConsumer {
    store: Arc<dyn LedgerStore>,
}

impl QuotaConsumer {
    /// Create a consumer over the given store
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Debit `amount` credits.
    ///
    /// Returns `Ok(false)` when the balance is insufficient (no ledger trace is
    /// left). Replaying a previously accepted debit returns `Ok(true)` without
    /// charging again. Errors only on invalid input or storage failure.
    pub async fn debit(
        &self,
        tenant: &TenantId,
        kind: CreditKind,
        amount: u64,
        token: &IdempotencyToken,
        description: &str,
    ) -> Result<bool, LedgerError> {
        let outcome = self
            .apply(tenant, kind, Direction::Debit, amount, token, description)
            .await?;
        Ok(outcome.accepted())
    }

    /// Credit `amount` credits.
    ///
    /// Used for administrative top-ups (fresh token) and for rolling back a
    /// debit (the debit's own token). Always `Ok(true)` unless the store fails.
    pub async fn credit(
        &self,
        tenant: &TenantId,
        kind: CreditKind,
        amount: u64,
        token: &IdempotencyToken,
        description: &str,
    ) -> Result<bool, LedgerError> {
        let outcome = self
            .apply(tenant, kind, Direction::Credit, amount, token, description)
            .await?;
        Ok(outcome.accepted())
    }

    /// Validate and apply a mutation, returning the detailed outcome
    #[instrument(
        skip_all,
        fields(tenant_id = %tenant, kind = %kind, direction = direction.as_str(), token = %token)
    )]
    pub async fn apply(
        &self,
        tenant: &TenantId,
        kind: CreditKind,
        direction: Direction,
        amount: u64,
        token: &IdempotencyToken,
        description: &str,
    ) -> Result<MutationOutcome, LedgerError> {
        if tenant.is_empty() {
            return Err(LedgerError::EmptyTenant);
        }
        if amount == 0 || amount > i64::MAX as u64 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        if token.is_empty() {
            return Err(LedgerError::EmptyToken);
        }

        let outcome = self
            .store
            .apply(LedgerMutation {
                tenant_id: tenant.clone(),
                kind,
                direction,
                amount,
                token: token.clone(),
                description: description.to_string(),
            })
            .await?;

        match outcome {
            MutationOutcome::Applied { balance } => {
                info!(amount, balance, "Ledger mutation applied");
            }
            MutationOutcome::Replayed { balance } => {
                debug!(amount, balance, "Ledger mutation replayed (idempotent no-op)");
            }
            MutationOutcome::Insufficient { balance } => {
                info!(amount, balance, "Debit refused: insufficient balance");
            }
        }

        Ok(outcome)
    }

    /// Current balance of one kind
    pub async fn balance(&self, tenant: &TenantId, kind: CreditKind) -> Result<u64, LedgerError> {
        Ok(self.store.balance(tenant, kind).await?)
    }

    /// Balances of every kind, zero-filled for kinds the tenant never held
    pub async fn balances(&self, tenant: &TenantId) -> Result<Vec<CreditBalance>, LedgerError> {
        let stored = self.store.balances(tenant).await?;
        Ok(CreditKind::ALL
            .iter()
            .map(|kind| CreditBalance {
                tenant_id: tenant.clone(),
                kind: *kind,
                balance: stored
                    .iter()
                    .find(|b| b.kind == *kind)
                    .map(|b| b.balance)
                    .unwrap_or(0),
            })
            .collect())
    }

    /// Ledger history, oldest first
    pub async fn history(
        &self,
        tenant: &TenantId,
        kind: CreditKind,
    ) -> Result<Vec<LedgerEntry>, LedgerError> {
        Ok(self.store.entries(tenant, kind).await?)
    }
}
