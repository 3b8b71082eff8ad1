//! Event deduplication.
//!
//! Providers deliver webhooks at least once. The provider's event id is the
//! authoritative identity of a delivery: the first insert of an id wins and
//! every later arrival (retry, concurrent redelivery) is reported as a
//! duplicate without error and without any reconciliation side effect.
//!
//! No content hashing is attempted here; ids missing from the envelope are
//! derived deterministically by the provider adapter before they get this far.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::StoreError;
use crate::ledger::TenantId;
use crate::webhook::events::{InboundEvent, ObjectType, Provider};

/// Webhook event row as it is first inserted
#[derive(Debug, Clone, PartialEq)]
pub struct NewWebhookEvent {
    pub event_id: String,
    pub provider: Provider,
    pub event_type: String,
    pub object_type: ObjectType,
    pub object_id: Option<String>,
    pub tenant_id: Option<TenantId>,
    /// Body exactly as delivered
    pub raw_payload: String,
    pub received_at: DateTime<Utc>,
}

impl NewWebhookEvent {
    /// Build the row for a normalized event and its resolved tenant
    pub fn from_inbound(event: &InboundEvent, tenant_id: Option<TenantId>) -> Self {
        Self {
            event_id: event.event_id.clone(),
            provider: event.provider,
            event_type: event.event_type.clone(),
            object_type: event.object_type,
            object_id: event.object_id.clone(),
            tenant_id,
            raw_payload: event.raw_payload.clone(),
            received_at: Utc::now(),
        }
    }
}

/// Persisted webhook event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: String,
    pub provider: Provider,
    pub event_type: String,
    pub object_type: ObjectType,
    pub object_id: Option<String>,
    pub tenant_id: Option<TenantId>,
    /// Body exactly as delivered
    pub raw_payload: String,
    pub matched: bool,
    pub matched_record_id: Option<String>,
    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl From<NewWebhookEvent> for StoredEvent {
    fn from(new: NewWebhookEvent) -> Self {
        Self {
            event_id: new.event_id,
            provider: new.provider,
            event_type: new.event_type,
            object_type: new.object_type,
            object_id: new.object_id,
            tenant_id: new.tenant_id,
            raw_payload: new.raw_payload,
            matched: false,
            matched_record_id: None,
            received_at: new.received_at,
            processed_at: None,
        }
    }
}

/// Result of [`EventStore::record_if_new`]
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    /// `true` for the first arrival of this event id
    pub is_new: bool,
    /// The stored row (the original one, for duplicates)
    pub event: StoredEvent,
}

/// Durable webhook event store keyed uniquely on `event_id`
#[async_trait]
pub trait EventStore: Send + Sync + 'static {
    /// Insert unless the id already exists. Concurrent inserts of the same id
    /// must yield exactly one `is_new = true`.
    async fn record_if_new(&self, event: NewWebhookEvent) -> Result<RecordOutcome, StoreError>;

    /// Flip `matched` from false to true and stamp `processed_at`.
    ///
    /// Returns `false` when the event was already matched (or is unknown);
    /// a matched event is never updated twice.
    async fn mark_matched(
        &self,
        event_id: &str,
        record_id: &str,
        processed_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Fetch a stored event
    async fn get_event(&self, event_id: &str) -> Result<Option<StoredEvent>, StoreError>;

    /// Unmatched events, oldest first
    async fn list_unmatched(&self, limit: usize) -> Result<Vec<StoredEvent>, StoreError>;
}

/// Thin front over an [`EventStore`] used by the pipeline
#[derive(Clone)]
pub struct Deduplicator {
    store: Arc<dyn EventStore>,
}

impl Deduplicator {
    pub fn new(store: Arc<dyn EventStore>) -> Self {
        Self { store }
    }

    /// Record the event, reporting whether this is its first arrival
    pub async fn record_if_new(
        &self,
        event: &InboundEvent,
        tenant_id: Option<TenantId>,
    ) -> Result<RecordOutcome, StoreError> {
        let outcome = self
            .store
            .record_if_new(NewWebhookEvent::from_inbound(event, tenant_id))
            .await?;
        if !outcome.is_new {
            debug!(event_id = %event.event_id, "Duplicate webhook delivery discarded");
        }
        Ok(outcome)
    }

    /// Mark an event as matched to a record
    pub async fn mark_matched(&self, event_id: &str, record_id: &str) -> Result<bool, StoreError> {
        self.store.mark_matched(event_id, record_id, Utc::now()).await
    }

    /// Fetch a stored event
    pub async fn get(&self, event_id: &str) -> Result<Option<StoredEvent>, StoreError> {
        self.store.get_event(event_id).await
    }

    /// Unmatched events awaiting replay
    pub async fn unmatched(&self, limit: usize) -> Result<Vec<StoredEvent>, StoreError> {
        self.store.list_unmatched(limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn inbound(id: &str) -> InboundEvent {
        InboundEvent::from_raw(
            Provider::Messaging,
            &json!({"event_id": id, "event": "message.sent", "data": {"message_id": "m1"}})
                .to_string(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_first_arrival_is_new() {
        let dedup = Deduplicator::new(Arc::new(MemoryStore::new()));
        let first = dedup.record_if_new(&inbound("evt-1"), None).await.unwrap();
        assert!(first.is_new);
        assert!(!first.event.matched);

        let second = dedup.record_if_new(&inbound("evt-1"), None).await.unwrap();
        assert!(!second.is_new);
        assert_eq!(second.event.event_id, "evt-1");
    }

    #[tokio::test]
    async fn test_mark_matched_only_once() {
        let dedup = Deduplicator::new(Arc::new(MemoryStore::new()));
        dedup.record_if_new(&inbound("evt-2"), None).await.unwrap();

        assert!(dedup.mark_matched("evt-2", "rec-1").await.unwrap());
        assert!(!dedup.mark_matched("evt-2", "rec-2").await.unwrap());

        let stored = dedup.get("evt-2").await.unwrap().unwrap();
        assert!(stored.matched);
        assert_eq!(stored.matched_record_id.as_deref(), Some("rec-1"));
        assert!(stored.processed_at.is_some());
        assert!(dedup.unmatched(10).await.unwrap().is_empty());
    }
}
