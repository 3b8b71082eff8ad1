//! Event reconciliation.
//!
//! Maps a normalized event to the tracked record it concerns and applies the
//! corresponding monotonic transition. The mapping is a static table; kinds
//! missing from it are stored by the pipeline but never acted on.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info};

use crate::error::StoreError;
use crate::webhook::events::{EventKind, InboundEvent};
use crate::webhook::records::{
    AuditContext, RecordStatus, RecordStore, TimestampField, Transition,
};

/// What a mapped event does to its target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetAction {
    /// Stamp `field`, move status towards `status`
    Advance(TimestampField, RecordStatus),
    /// Mark the record failed with the provider's error text
    Fail,
}

/// Static mapping from event kind to target action
pub fn target_action(kind: EventKind) -> Option<TargetAction> {
    use TargetAction::{Advance, Fail};
    match kind {
        EventKind::MessageSent => Some(Advance(TimestampField::SentAt, RecordStatus::Sent)),
        EventKind::MessageDelivered => {
            Some(Advance(TimestampField::DeliveredAt, RecordStatus::Sent))
        }
        EventKind::MessageSeen => Some(Advance(TimestampField::SeenAt, RecordStatus::Sent)),
        EventKind::MessageReplied => {
            Some(Advance(TimestampField::RepliedAt, RecordStatus::Replied))
        }
        EventKind::InvitationSent => Some(Advance(TimestampField::SentAt, RecordStatus::Sent)),
        EventKind::InvitationAccepted => {
            Some(Advance(TimestampField::AcceptedAt, RecordStatus::Accepted))
        }
        EventKind::RunSucceeded => {
            Some(Advance(TimestampField::CompletedAt, RecordStatus::Completed))
        }
        EventKind::MessageFailed | EventKind::InvitationFailed | EventKind::RunFailed => {
            Some(Fail)
        }
        EventKind::Unknown => None,
    }
}

/// Why an event did not match a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UnmatchedReason {
    /// Event type has no mapping
    UnknownEventType,
    /// Envelope named no message/invitation/run id
    MissingObjectId,
    /// No record is tracked under the object id
    RecordNotFound,
}

impl UnmatchedReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UnknownEventType => "unknown_event_type",
            Self::MissingObjectId => "missing_object_id",
            Self::RecordNotFound => "record_not_found",
        }
    }
}

/// Result of reconciling one event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Matched {
        record_id: String,
        /// Whether the record actually changed
        changed: bool,
        status: RecordStatus,
    },
    Unmatched(UnmatchedReason),
}

impl ReconcileOutcome {
    pub fn is_matched(&self) -> bool {
        matches!(self, Self::Matched { .. })
    }

    pub fn record_id(&self) -> Option<&str> {
        match self {
            Self::Matched { record_id, .. } => Some(record_id),
            Self::Unmatched(_) => None,
        }
    }
}

/// Applies events to tracked records
#[derive(Clone)]
pub struct Reconciler {
    records: Arc<dyn RecordStore>,
}

impl Reconciler {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }

    /// Reconcile one event.
    ///
    /// A match always writes exactly one audit row, even when the record was
    /// already in the target state. Errors are storage failures only.
    pub async fn reconcile(
        &self,
        event: &InboundEvent,
        correlation_id: &str,
    ) -> Result<ReconcileOutcome, StoreError> {
        let Some(action) = target_action(event.kind) else {
            debug!(
                event_id = %event.event_id,
                event_type = %event.event_type,
                "No mapping for event type, stored only"
            );
            return Ok(ReconcileOutcome::Unmatched(UnmatchedReason::UnknownEventType));
        };

        let Some(reference) = event.object_ref() else {
            return Ok(ReconcileOutcome::Unmatched(UnmatchedReason::MissingObjectId));
        };

        let Some(record) = self.records.find_record(&reference).await? else {
            debug!(event_id = %event.event_id, object = %reference, "No tracked record for object");
            return Ok(ReconcileOutcome::Unmatched(UnmatchedReason::RecordNotFound));
        };

        let at = event.occurred_at.unwrap_or_else(Utc::now);
        let transition = match action {
            TargetAction::Advance(field, status) => Transition::Advance { field, status, at },
            TargetAction::Fail => Transition::Fail {
                error: event
                    .error
                    .clone()
                    .unwrap_or_else(|| format!("provider reported {}", event.event_type)),
                at,
            },
        };
        let context = AuditContext {
            event_id: event.event_id.clone(),
            event_type: event.event_type.clone(),
            correlation_id: correlation_id.to_string(),
        };

        let outcome = self
            .records
            .apply_transition(&record.id, &transition, &context)
            .await?;

        info!(
            event_id = %event.event_id,
            record_id = %record.id,
            previous_status = %outcome.audit.previous_status,
            status = %outcome.record.status,
            changed = outcome.changed(),
            "Event reconciled"
        );

        Ok(ReconcileOutcome::Matched {
            record_id: record.id,
            changed: outcome.changed(),
            status: outcome.record.status,
        })
    }
}
