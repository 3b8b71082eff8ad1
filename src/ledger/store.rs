//! Ledger storage seam.
//!
//! A [`LedgerStore`] owns the credit balances and the append-only ledger. The
//! single write operation, [`LedgerStore::apply`], must be atomic: the
//! idempotency check, the balance check and the two writes happen in one
//! transaction, and concurrent applies for the same `(tenant, kind)` are
//! serialized so two debits can never both observe the same balance.

use async_trait::async_trait;

use crate::error::StoreError;
use crate::ledger::types::{
    CreditBalance, CreditKind, LedgerEntry, LedgerMutation, MutationOutcome, TenantId,
};

#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    /// Apply a mutation exactly once per `(tenant, kind, token, direction)`.
    ///
    /// - existing entry with the same key: [`MutationOutcome::Replayed`], no writes
    /// - debit larger than the balance: [`MutationOutcome::Insufficient`], no writes
    /// - otherwise: entry appended, balance updated, [`MutationOutcome::Applied`]
    async fn apply(&self, mutation: LedgerMutation) -> Result<MutationOutcome, StoreError>;

    /// Current balance; zero when the tenant never held this kind
    async fn balance(&self, tenant: &TenantId, kind: CreditKind) -> Result<u64, StoreError>;

    /// All balances of one tenant
    async fn balances(&self, tenant: &TenantId) -> Result<Vec<CreditBalance>, StoreError>;

    /// Ledger history of one tenant and kind, oldest first
    async fn entries(
        &self,
        tenant: &TenantId,
        kind: CreditKind,
    ) -> Result<Vec<LedgerEntry>, StoreError>;
}
