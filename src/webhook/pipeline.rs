//! Webhook Ingestion Pipeline
//!
//! ```text
//! Webhook Received
//!       |
//!       v
//! [Verify Signature] --> invalid --> success=false, nothing stored
//!       |
//!       v
//! [Parse Envelope]   --> unreadable --> success=false, nothing stored
//!       |
//!       v
//! [Record If New]    --> duplicate --> success=true, no side effects
//!       |                (committed before any reconciliation)
//!       v
//! [Reconcile]        --> unmatched --> event kept for replay
//!       |
//!       v
//! [Mark Matched]
//! ```
//!
//! [`WebhookPipeline::ingest`] never returns an error: every outcome becomes
//! an [`IngestReport`] and the HTTP layer always answers 200.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::error::StoreError;
use crate::ledger::TenantId;
use crate::metrics::{Metrics, WebhookOutcome};
use crate::webhook::dedup::Deduplicator;
use crate::webhook::events::{InboundEvent, Provider};
use crate::webhook::reconciler::{ReconcileOutcome, Reconciler};
use crate::webhook::records::RecordStore;
use crate::webhook::signature::SignatureVerifier;

/// Outcome of one webhook delivery; serialized as the HTTP response body
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngestReport {
    pub success: bool,
    pub correlation_id: String,
    pub event_id: Option<String>,
    pub event_type: Option<String>,
    pub matched: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub matched_id: Option<String>,
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl IngestReport {
    fn rejected(correlation_id: String, error: String) -> Self {
        Self {
            success: false,
            correlation_id,
            event_id: None,
            event_type: None,
            matched: false,
            matched_id: None,
            duplicate: false,
            error: Some(error),
        }
    }

    /// Report for a delivery whose ingestion task died before finishing
    pub fn aborted(error: String) -> Self {
        Self::rejected(Uuid::new_v4().to_string(), error)
    }

    fn for_event(correlation_id: String, event: &InboundEvent) -> Self {
        Self {
            success: true,
            correlation_id,
            event_id: Some(event.event_id.clone()),
            event_type: Some(event.event_type.clone()),
            matched: false,
            matched_id: None,
            duplicate: false,
            error: None,
        }
    }
}

/// Summary of a replay run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplayReport {
    pub examined: usize,
    pub matched: usize,
    pub unmatched: usize,
    pub failed: usize,
}

/// Verify, deduplicate and reconcile inbound provider events
#[derive(Clone)]
pub struct WebhookPipeline {
    verifier: SignatureVerifier,
    dedup: Deduplicator,
    reconciler: Reconciler,
    records: Arc<dyn RecordStore>,
    metrics: Arc<Metrics>,
}

impl WebhookPipeline {
    pub fn new(
        verifier: SignatureVerifier,
        dedup: Deduplicator,
        reconciler: Reconciler,
        records: Arc<dyn RecordStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            verifier,
            dedup,
            reconciler,
            records,
            metrics,
        }
    }

    pub fn verifier(&self) -> &SignatureVerifier {
        &self.verifier
    }

    /// Handle one raw delivery
    #[instrument(skip(self, body, signature), fields(correlation_id = tracing::field::Empty))]
    pub async fn ingest(
        &self,
        provider: Provider,
        body: &[u8],
        signature: Option<&str>,
    ) -> IngestReport {
        let correlation_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("correlation_id", correlation_id.as_str());

        if let Err(e) = self.verifier.verify(body, signature) {
            warn!(%provider, error = %e, "Webhook rejected");
            self.metrics.record_webhook(WebhookOutcome::Rejected);
            return IngestReport::rejected(correlation_id, e.to_string());
        }

        let event = match InboundEvent::from_bytes(provider, body) {
            Ok(event) => event,
            Err(e) => {
                warn!(%provider, error = %e, "Unreadable webhook payload");
                self.metrics.record_webhook(WebhookOutcome::Rejected);
                return IngestReport::rejected(correlation_id, e.to_string());
            }
        };

        self.process(event, correlation_id).await
    }

    /// Deduplicate then reconcile an already-parsed event
    pub async fn process(&self, event: InboundEvent, correlation_id: String) -> IngestReport {
        let mut report = IngestReport::for_event(correlation_id, &event);
        let tenant = self.resolve_tenant(&event).await;

        let recorded = match self.dedup.record_if_new(&event, tenant).await {
            Ok(recorded) => recorded,
            Err(e) => {
                error!(event_id = %event.event_id, error = %e, "Failed to store webhook event");
                self.metrics.record_webhook(WebhookOutcome::Error);
                report.success = false;
                report.error = Some(e.to_string());
                return report;
            }
        };

        if !recorded.is_new {
            self.metrics.record_webhook(WebhookOutcome::Duplicate);
            report.duplicate = true;
            report.matched = recorded.event.matched;
            report.matched_id = recorded.event.matched_record_id;
            return report;
        }

        match self.reconcile_stored(&event, &report.correlation_id).await {
            Ok(Some(record_id)) => {
                self.metrics.record_webhook(WebhookOutcome::Matched);
                report.matched = true;
                report.matched_id = Some(record_id);
            }
            Ok(None) => {
                self.metrics.record_webhook(WebhookOutcome::Unmatched);
            }
            Err(message) => {
                self.metrics.record_webhook(WebhookOutcome::Error);
                report.success = false;
                report.error = Some(message);
            }
        }
        report
    }

    /// Reconcile and flag the stored row. `Ok(None)` when unmatched; errors
    /// are logged here and leave the event unmatched for replay.
    async fn reconcile_stored(
        &self,
        event: &InboundEvent,
        correlation_id: &str,
    ) -> Result<Option<String>, String> {
        let outcome = match self.reconciler.reconcile(event, correlation_id).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(event_id = %event.event_id, error = %e, "Reconciliation failed, event kept unmatched");
                return Err(e.to_string());
            }
        };

        match outcome {
            ReconcileOutcome::Matched { record_id, .. } => {
                if let Err(e) = self.dedup.mark_matched(&event.event_id, &record_id).await {
                    warn!(
                        event_id = %event.event_id,
                        record_id = %record_id,
                        error = %e,
                        "Record updated but event could not be flagged as matched"
                    );
                }
                Ok(Some(record_id))
            }
            ReconcileOutcome::Unmatched(reason) => {
                info!(
                    event_id = %event.event_id,
                    event_type = %event.event_type,
                    reason = reason.as_str(),
                    "Webhook event stored unmatched"
                );
                Ok(None)
            }
        }
    }

    async fn resolve_tenant(&self, event: &InboundEvent) -> Option<TenantId> {
        let account_id = event.account_id.as_deref()?;
        match self.records.tenant_for_account(account_id).await {
            Ok(tenant) => {
                if tenant.is_none() {
                    debug!(account_id, "No tenant registered for provider account");
                }
                tenant
            }
            Err(e) => {
                warn!(account_id, error = %e, "Tenant lookup failed");
                None
            }
        }
    }

    /// Re-run reconciliation for stored unmatched events, oldest first
    #[instrument(skip(self))]
    pub async fn replay_unmatched(&self, limit: usize) -> Result<ReplayReport, StoreError> {
        let pending = self.dedup.unmatched(limit).await?;
        let mut report = ReplayReport {
            examined: pending.len(),
            ..ReplayReport::default()
        };

        for stored in pending {
            let mut event = match InboundEvent::from_raw(stored.provider, &stored.raw_payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!(event_id = %stored.event_id, error = %e, "Stored payload no longer parses");
                    report.failed += 1;
                    continue;
                }
            };
            // Keep the stored identity even if the derivation rules changed.
            event.event_id = stored.event_id;

            let correlation_id = Uuid::new_v4().to_string();
            match self.reconcile_stored(&event, &correlation_id).await {
                Ok(Some(_)) => report.matched += 1,
                Ok(None) => report.unmatched += 1,
                Err(_) => report.failed += 1,
            }
        }

        info!(
            examined = report.examined,
            matched = report.matched,
            unmatched = report.unmatched,
            failed = report.failed,
            "Replay finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::webhook::dedup::EventStore;
    use crate::webhook::events::{ObjectRef, ObjectType};
    use crate::webhook::records::{NewRecord, RecordKind, RecordStatus};
    use crate::webhook::signature::sign;
    use serde_json::json;

    fn pipeline(store: Arc<MemoryStore>, secret: Option<&str>) -> WebhookPipeline {
        WebhookPipeline::new(
            SignatureVerifier::new(secret.map(String::from), "x-webhook-signature"),
            Deduplicator::new(store.clone()),
            Reconciler::new(store.clone()),
            store,
            Arc::new(Metrics::new()),
        )
    }

    #[tokio::test]
    async fn test_bad_signature_stores_nothing() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(store.clone(), Some("secret"));
        let body = json!({"event_id": "evt-1", "event": "message.sent"}).to_string();

        let report = pipeline
            .ingest(Provider::Messaging, body.as_bytes(), Some("sha256=00"))
            .await;
        assert!(!report.success);
        assert!(store.get_event("evt-1").await.unwrap().is_none());

        let good = sign(body.as_bytes(), b"secret");
        let report = pipeline
            .ingest(Provider::Messaging, body.as_bytes(), Some(&good))
            .await;
        assert!(report.success);
        assert_eq!(report.event_id.as_deref(), Some("evt-1"));
    }

    #[tokio::test]
    async fn test_unreadable_payload_is_reported() {
        let pipeline = pipeline(Arc::new(MemoryStore::new()), None);
        let report = pipeline.ingest(Provider::Messaging, b"{not json", None).await;
        assert!(!report.success);
        assert!(report.error.is_some());
    }

    #[tokio::test]
    async fn test_tenant_resolved_from_account() {
        let store = Arc::new(MemoryStore::new());
        store.register_account("acc-1", &"acme".into()).await.unwrap();
        let pipeline = pipeline(store.clone(), None);

        let body = json!({"event_id": "evt-5", "event": "message.seen", "data": {"account_id": "acc-1"}});
        pipeline
            .ingest(Provider::Messaging, body.to_string().as_bytes(), None)
            .await;
        let stored = store.get_event("evt-5").await.unwrap().unwrap();
        assert_eq!(stored.tenant_id, Some(TenantId::new("acme")));
    }

    #[tokio::test]
    async fn test_replay_matches_late_record() {
        let store = Arc::new(MemoryStore::new());
        let pipeline = pipeline(store.clone(), None);
        let body = json!({"event_id": "evt-9", "event": "message.sent", "data": {"message_id": "late"}});

        let report = pipeline
            .ingest(Provider::Messaging, body.to_string().as_bytes(), None)
            .await;
        assert!(!report.matched);

        store
            .create_record(NewRecord {
                kind: RecordKind::CampaignLead,
                tenant_id: "acme".into(),
                reference: ObjectRef::new(ObjectType::Message, "late"),
                status: RecordStatus::Pending,
                sent_at: None,
            })
            .await
            .unwrap();

        let replay = pipeline.replay_unmatched(10).await.unwrap();
        assert_eq!(replay, ReplayReport { examined: 1, matched: 1, unmatched: 0, failed: 0 });
        assert!(store.get_event("evt-9").await.unwrap().unwrap().matched);

        let again = pipeline.replay_unmatched(10).await.unwrap();
        assert_eq!(again.examined, 0);
    }
}
