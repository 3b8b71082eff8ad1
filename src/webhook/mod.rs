//! Webhook ingestion and reconciliation
//!
//! Provider deliveries (messaging platform, actor platform) are verified,
//! normalized into an [`InboundEvent`], stored exactly once by event id and
//! then applied to the tracked record they concern.
//!
//! ```text
//! POST /webhooks/{provider}
//!        │
//!        ▼
//!  SignatureVerifier ──▶ InboundEvent ──▶ Deduplicator ──▶ Reconciler
//!                         (adapter)       (event store)   (record store + audit)
//! ```

pub mod dedup;
pub mod events;
pub mod handler;
pub mod pipeline;
pub mod reconciler;
pub mod records;
pub mod signature;

pub use dedup::{Deduplicator, EventStore, NewWebhookEvent, RecordOutcome, StoredEvent};
pub use events::{EventKind, InboundEvent, ObjectRef, ObjectType, Provider};
pub use pipeline::{IngestReport, ReplayReport, WebhookPipeline};
pub use reconciler::{ReconcileOutcome, Reconciler, TargetAction, UnmatchedReason};
pub use records::{
    AuditContext, AuditEntry, NewRecord, RecordKind, RecordStatus, RecordStore, TimestampField,
    TrackedRecord, Transition, TransitionOutcome,
};
pub use signature::SignatureVerifier;
