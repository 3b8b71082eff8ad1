//! Leadflow Core - webhook reconciliation and credit ledger
//!
//! The service sits between the Leadflow app and two providers: a messaging
//! platform that reports what happened to outreach messages and invitations,
//! and an actor platform that runs paid lead searches and phone reveals.
//!
//! # Architecture
//!
//! ```text
//! Provider ──▶ /webhooks/* ──▶ WebhookPipeline ──▶ EventStore (dedup)
//!                                    │
//!                                    ▼
//!                               Reconciler ──▶ RecordStore (+ audit trail)
//!
//! App ──▶ /actions/* ──▶ Orchestrator ──debit──▶ QuotaConsumer ──▶ LedgerStore
//!                             │    ▲
//!                             ▼    └──rollback credit (same token)
//!                        JobLauncher (actor platform)
//! ```
//!
//! # Guarantees
//!
//! - Credits never go negative, even under concurrent debits.
//! - A debit and its rollback share one idempotency token; each applies once.
//! - A webhook event id is stored once; duplicates have no side effects.
//! - Record status only moves forward and `failed` is terminal.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use leadflow_core::ledger::{CreditKind, IdempotencyToken, QuotaConsumer};
//! use leadflow_core::store::Stores;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let stores = Stores::sqlite("leadflow.db").await?;
//!     let quota = QuotaConsumer::new(stores.ledger.clone());
//!
//!     let tenant = "acme".into();
//!     quota
//!         .credit(&tenant, CreditKind::LeadSearch, 100, &IdempotencyToken::generate(), "grant")
//!         .await?;
//!     println!("{}", quota.balance(&tenant, CreditKind::LeadSearch).await?);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod cors;
pub mod error;
pub mod handlers;
pub mod ledger;
pub mod metered;
pub mod metrics;
pub mod security;
pub mod server;
pub mod store;
pub mod webhook;

// Re-exports for convenience
pub use config::AppConfig;
pub use error::{ConfigError, LedgerError, MeteredActionError, StoreError, WebhookError};
pub use ledger::{CreditKind, IdempotencyToken, QuotaConsumer, TenantId};
pub use metered::{ActorClient, JobLauncher, Orchestrator};
pub use metrics::Metrics;
pub use server::{build_router, AppState};
pub use store::{MemoryStore, SqliteStore, Stores};
pub use webhook::{Deduplicator, Reconciler, WebhookPipeline};
