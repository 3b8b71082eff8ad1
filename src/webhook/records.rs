//! Tracked records and their status machine.
//!
//! A tracked record is the internal object a provider event reconciles
//! against: a campaign lead (messages and invitations) or an enrichment job
//! (actor runs started by a metered action).
//!
//! Status only ever moves forward:
//!
//! ```text
//! pending ──▶ sent ──▶ accepted ──▶ replied      (campaign lead)
//!    │          │
//!    │          └─────────────────▶ completed    (enrichment job)
//!    │          │
//!    └──────────┴──▶ failed   (terminal, frozen)
//! ```
//!
//! Delivery and seen receipts are markers on a `sent` record; they stamp their
//! timestamp but do not change status.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::StoreError;
use crate::ledger::TenantId;
use crate::webhook::events::ObjectRef;

/// What kind of internal object a record is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    CampaignLead,
    EnrichmentJob,
}

impl RecordKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CampaignLead => "campaign_lead",
            Self::EnrichmentJob => "enrichment_job",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "campaign_lead" => Ok(Self::CampaignLead),
            "enrichment_job" => Ok(Self::EnrichmentJob),
            other => Err(format!("unknown record kind: {other}")),
        }
    }
}

/// Business status of a tracked record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Pending,
    Sent,
    Accepted,
    Replied,
    Completed,
    /// Terminal. Requires administrative correction to leave.
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Accepted => "accepted",
            Self::Replied => "replied",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Position in the success progression. `None` for `failed`.
    pub fn rank(&self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Sent => Some(1),
            Self::Accepted => Some(2),
            Self::Replied | Self::Completed => Some(3),
            Self::Failed => None,
        }
    }

    /// Whether a failure event may still land on this status.
    ///
    /// Once the recipient engaged (accepted, replied) or a job completed, a
    /// late failure report is stale and ignored.
    pub fn can_fail(&self) -> bool {
        matches!(self, Self::Pending | Self::Sent)
    }

    /// Status after a success event targeting `target`: the further of the two
    pub fn advance(self, target: RecordStatus) -> RecordStatus {
        match (self.rank(), target.rank()) {
            (Some(current), Some(next)) if next > current => target,
            _ => self,
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "sent" => Ok(Self::Sent),
            "accepted" => Ok(Self::Accepted),
            "replied" => Ok(Self::Replied),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown record status: {other}")),
        }
    }
}

/// Timestamp columns a success event may stamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimestampField {
    SentAt,
    DeliveredAt,
    SeenAt,
    RepliedAt,
    AcceptedAt,
    CompletedAt,
}

impl TimestampField {
    /// Column / JSON name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SentAt => "sent_at",
            Self::DeliveredAt => "delivered_at",
            Self::SeenAt => "seen_at",
            Self::RepliedAt => "replied_at",
            Self::AcceptedAt => "accepted_at",
            Self::CompletedAt => "completed_at",
        }
    }
}

/// Internal record reconciled against provider events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackedRecord {
    pub id: String,
    pub kind: RecordKind,
    pub tenant_id: TenantId,
    pub status: RecordStatus,
    pub sent_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub seen_at: Option<DateTime<Utc>>,
    pub replied_at: Option<DateTime<Utc>>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackedRecord {
    pub fn timestamp(&self, field: TimestampField) -> Option<DateTime<Utc>> {
        match field {
            TimestampField::SentAt => self.sent_at,
            TimestampField::DeliveredAt => self.delivered_at,
            TimestampField::SeenAt => self.seen_at,
            TimestampField::RepliedAt => self.replied_at,
            TimestampField::AcceptedAt => self.accepted_at,
            TimestampField::CompletedAt => self.completed_at,
        }
    }

    fn timestamp_mut(&mut self, field: TimestampField) -> &mut Option<DateTime<Utc>> {
        match field {
            TimestampField::SentAt => &mut self.sent_at,
            TimestampField::DeliveredAt => &mut self.delivered_at,
            TimestampField::SeenAt => &mut self.seen_at,
            TimestampField::RepliedAt => &mut self.replied_at,
            TimestampField::AcceptedAt => &mut self.accepted_at,
            TimestampField::CompletedAt => &mut self.completed_at,
        }
    }

    /// Apply a transition in place. Returns whether anything changed.
    ///
    /// - a `failed` record is frozen
    /// - failure lands only on `pending`/`sent`, recording the provider error
    /// - success advances status monotonically, stamps its timestamp if unset
    ///   and clears a recorded error
    pub fn apply(&mut self, transition: &Transition) -> bool {
        if self.status == RecordStatus::Failed {
            return false;
        }

        let changed = match transition {
            Transition::Fail { error, .. } => {
                if !self.status.can_fail() {
                    return false;
                }
                self.status = RecordStatus::Failed;
                self.last_error = Some(error.clone());
                true
            }
            Transition::Advance { field, status, at } => {
                let mut changed = false;

                let next = self.status.advance(*status);
                if next != self.status {
                    self.status = next;
                    changed = true;
                }

                if self.timestamp(*field).is_none() {
                    *self.timestamp_mut(*field) = Some(*at);
                    changed = true;
                }

                if self.last_error.take().is_some() {
                    changed = true;
                }
                changed
            }
        };

        if changed {
            self.updated_at = transition.at();
        }
        changed
    }
}

/// Change requested by a reconciled event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Success event: move towards `status`, stamp `field`
    Advance {
        field: TimestampField,
        status: RecordStatus,
        at: DateTime<Utc>,
    },
    /// Failure event
    Fail { error: String, at: DateTime<Utc> },
}

impl Transition {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            Self::Advance { at, .. } | Self::Fail { at, .. } => *at,
        }
    }
}

/// Identity of the event that triggered a transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditContext {
    pub event_id: String,
    pub event_type: String,
    pub correlation_id: String,
}

/// Audit trail row. One per successfully matched event, whether or not the
/// record actually changed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: String,
    pub record_id: String,
    pub event_id: String,
    pub event_type: String,
    pub correlation_id: String,
    pub previous_status: RecordStatus,
    pub new_status: RecordStatus,
    pub changed: bool,
    pub created_at: DateTime<Utc>,
}

/// Result of [`RecordStore::apply_transition`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionOutcome {
    /// Record after the transition
    pub record: TrackedRecord,
    pub audit: AuditEntry,
}

impl TransitionOutcome {
    pub fn changed(&self) -> bool {
        self.audit.changed
    }
}

/// Apply `transition` to `record` and build the matching audit row.
///
/// Shared by every store backend so the status rules live in one place.
pub(crate) fn transition_record(
    record: &mut TrackedRecord,
    transition: &Transition,
    context: &AuditContext,
) -> AuditEntry {
    let previous_status = record.status;
    let changed = record.apply(transition);
    AuditEntry {
        id: Uuid::new_v4().to_string(),
        record_id: record.id.clone(),
        event_id: context.event_id.clone(),
        event_type: context.event_type.clone(),
        correlation_id: context.correlation_id.clone(),
        previous_status,
        new_status: record.status,
        changed,
        created_at: Utc::now(),
    }
}

/// Request to start tracking a record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewRecord {
    pub kind: RecordKind,
    pub tenant_id: TenantId,
    /// Provider object the record is first known by
    pub reference: ObjectRef,
    pub status: RecordStatus,
    pub sent_at: Option<DateTime<Utc>>,
}

impl NewRecord {
    /// Materialize with a fresh id
    pub fn into_record(self, now: DateTime<Utc>) -> TrackedRecord {
        TrackedRecord {
            id: Uuid::new_v4().to_string(),
            kind: self.kind,
            tenant_id: self.tenant_id,
            status: self.status,
            sent_at: self.sent_at,
            delivered_at: None,
            seen_at: None,
            replied_at: None,
            accepted_at: None,
            completed_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Storage for tracked records, their provider references, the audit trail
/// and the provider account directory.
#[async_trait]
pub trait RecordStore: Send + Sync + 'static {
    /// Create a record keyed by its reference. If the reference is already
    /// mapped, the existing record is returned unchanged.
    async fn create_record(&self, record: NewRecord) -> Result<TrackedRecord, StoreError>;

    /// Resolve a provider object to its record
    async fn find_record(&self, reference: &ObjectRef)
        -> Result<Option<TrackedRecord>, StoreError>;

    async fn get_record(&self, record_id: &str) -> Result<Option<TrackedRecord>, StoreError>;

    /// Apply a transition and append its audit row atomically.
    /// Fails with [`StoreError::NotFound`] for an unknown record.
    async fn apply_transition(
        &self,
        record_id: &str,
        transition: &Transition,
        context: &AuditContext,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Audit rows of a record, oldest first
    async fn audit_trail(&self, record_id: &str) -> Result<Vec<AuditEntry>, StoreError>;

    /// Map a provider account to a tenant (upsert)
    async fn register_account(&self, account_id: &str, tenant: &TenantId)
        -> Result<(), StoreError>;

    async fn tenant_for_account(&self, account_id: &str) -> Result<Option<TenantId>, StoreError>;
}
