//! Credit ledger
//!
//! Per-tenant credit balances with an append-only history. Every balance
//! change goes through [`QuotaConsumer`], which is idempotent on the
//! caller-supplied [`IdempotencyToken`].
//!
//! ```text
//! debit(token) ──▶ [entry exists?] ──yes──▶ replay: return original result
//!                        │ no
//!                        ▼
//!                 [balance >= amount?] ──no──▶ false, nothing written
//!                        │ yes
//!                        ▼
//!              append entry + decrement (one transaction)
//! ```

pub mod quota;
pub mod store;
pub mod types;

pub use quota::QuotaConsumer;
pub use store::LedgerStore;
pub use types::{
    CreditBalance, CreditKind, Direction, IdempotencyToken, LedgerEntry, LedgerMutation,
    MutationOutcome, TenantId,
};
