//! End-to-end webhook ingestion: dedup, reconciliation, audit, replay.

use std::sync::Arc;

use chrono::Utc;
use leadflow_core::metrics::Metrics;
use leadflow_core::store::{MemoryStore, SqliteStore};
use leadflow_core::webhook::signature::{sign, verify_signature};
use leadflow_core::webhook::{
    Deduplicator, EventStore, NewRecord, ObjectRef, ObjectType, Provider, RecordKind,
    RecordStatus, RecordStore, Reconciler, SignatureVerifier, WebhookPipeline,
};
use pretty_assertions::assert_eq;
use serde_json::json;

fn pipeline_over<S>(store: Arc<S>, secret: Option<&str>) -> WebhookPipeline
where
    S: EventStore + RecordStore,
{
    WebhookPipeline::new(
        SignatureVerifier::new(secret.map(String::from), "x-webhook-signature"),
        Deduplicator::new(store.clone()),
        Reconciler::new(store.clone()),
        store,
        Arc::new(Metrics::new()),
    )
}

async fn campaign_lead<S: RecordStore>(store: &S, message_id: &str, status: RecordStatus) -> String {
    store
        .create_record(NewRecord {
            kind: RecordKind::CampaignLead,
            tenant_id: "acme".into(),
            reference: ObjectRef::new(ObjectType::Message, message_id),
            status,
            sent_at: Some(Utc::now()),
        })
        .await
        .unwrap()
        .id
}

fn delivered_payload() -> Vec<u8> {
    json!({
        "event_id": "evt-100",
        "event": "message.delivered",
        "data": {"message_id": "m1", "account_id": "acc-1"}
    })
    .to_string()
    .into_bytes()
}

async fn delivered_then_duplicate<S>(store: Arc<S>)
where
    S: EventStore + RecordStore,
{
    let record_id = campaign_lead(store.as_ref(), "m1", RecordStatus::Sent).await;
    let pipeline = pipeline_over(store.clone(), None);

    let first = pipeline.ingest(Provider::Messaging, &delivered_payload(), None).await;
    assert!(first.success);
    assert!(first.matched);
    assert!(!first.duplicate);
    assert_eq!(first.matched_id.as_deref(), Some(record_id.as_str()));
    assert_eq!(first.event_type.as_deref(), Some("message.delivered"));

    let record = store.get_record(&record_id).await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Sent);
    assert!(record.delivered_at.is_some());
    assert_eq!(store.audit_trail(&record_id).await.unwrap().len(), 1);

    let second = pipeline.ingest(Provider::Messaging, &delivered_payload(), None).await;
    assert!(second.success);
    assert!(second.duplicate);
    assert!(second.matched);
    assert_eq!(store.audit_trail(&record_id).await.unwrap().len(), 1);
    assert_eq!(
        store.get_record(&record_id).await.unwrap().unwrap().updated_at,
        record.updated_at
    );
}

#[tokio::test]
async fn test_delivered_then_duplicate_memory() {
    delivered_then_duplicate(Arc::new(MemoryStore::new())).await;
}

#[tokio::test]
async fn test_delivered_then_duplicate_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("events.db"));
    store.init().await.unwrap();
    delivered_then_duplicate(Arc::new(store)).await;
}

#[tokio::test]
async fn test_unknown_event_type_is_stored_unmatched() {
    let store = Arc::new(MemoryStore::new());
    let record_id = campaign_lead(store.as_ref(), "m1", RecordStatus::Sent).await;
    let pipeline = pipeline_over(store.clone(), None);

    let payload = json!({
        "event_id": "evt-200",
        "event": "message.unsubscribed",
        "data": {"message_id": "m1"}
    });
    let report = pipeline
        .ingest(Provider::Messaging, payload.to_string().as_bytes(), None)
        .await;
    assert!(report.success);
    assert!(!report.matched);

    let stored = store.get_event("evt-200").await.unwrap().unwrap();
    assert!(!stored.matched);
    assert_eq!(stored.raw_payload, payload.to_string());
    assert!(store.audit_trail(&record_id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_is_terminal() {
    let store = Arc::new(MemoryStore::new());
    let record_id = campaign_lead(store.as_ref(), "m1", RecordStatus::Sent).await;
    let pipeline = pipeline_over(store.clone(), None);

    let send = |id: &str, event: &str| {
        json!({"event_id": id, "event": event, "data": {"message_id": "m1", "error": "recipient blocked"}})
            .to_string()
    };

    pipeline
        .ingest(Provider::Messaging, send("e1", "message.failed").as_bytes(), None)
        .await;
    let failed = store.get_record(&record_id).await.unwrap().unwrap();
    assert_eq!(failed.status, RecordStatus::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("recipient blocked"));

    // A late reply and a second failure leave the record untouched
    pipeline
        .ingest(Provider::Messaging, send("e2", "message.replied").as_bytes(), None)
        .await;
    pipeline
        .ingest(Provider::Messaging, send("e3", "message.failed").as_bytes(), None)
        .await;

    let after = store.get_record(&record_id).await.unwrap().unwrap();
    assert_eq!(after.status, RecordStatus::Failed);
    assert!(after.replied_at.is_none());
    assert_eq!(after.updated_at, failed.updated_at);

    let trail = store.audit_trail(&record_id).await.unwrap();
    assert_eq!(trail.len(), 3);
    assert!(trail[0].changed);
    assert!(!trail[1].changed);
    assert!(!trail[2].changed);
}

#[tokio::test]
async fn test_status_never_regresses() {
    let store = Arc::new(MemoryStore::new());
    let record_id = campaign_lead(store.as_ref(), "m1", RecordStatus::Sent).await;
    let pipeline = pipeline_over(store.clone(), None);

    for (id, event) in [("r1", "message.replied"), ("r2", "message.sent"), ("r3", "message.seen")] {
        let body = json!({"event_id": id, "event": event, "data": {"message_id": "m1"}}).to_string();
        pipeline.ingest(Provider::Messaging, body.as_bytes(), None).await;
    }

    let record = store.get_record(&record_id).await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Replied);
    assert!(record.seen_at.is_some());
}

async fn concurrent_identical_deliveries<S>(store: Arc<S>)
where
    S: EventStore + RecordStore,
{
    let record_id = campaign_lead(store.as_ref(), "m1", RecordStatus::Sent).await;
    let pipeline = pipeline_over(store.clone(), None);

    let tasks: Vec<_> = (0..20)
        .map(|_| {
            let pipeline = pipeline.clone();
            tokio::spawn(async move {
                pipeline
                    .ingest(Provider::Messaging, &delivered_payload(), None)
                    .await
            })
        })
        .collect();
    let reports: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert!(reports.iter().all(|r| r.success));
    assert_eq!(reports.iter().filter(|r| !r.duplicate).count(), 1);
    assert_eq!(store.audit_trail(&record_id).await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_deliveries_memory() {
    concurrent_identical_deliveries(Arc::new(MemoryStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_identical_deliveries_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("events.db"));
    store.init().await.unwrap();
    concurrent_identical_deliveries(Arc::new(store)).await;
}

#[tokio::test]
async fn test_raw_payload_stored_verbatim() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::new(dir.path().join("events.db"));
    store.init().await.unwrap();
    let store = Arc::new(store);
    let pipeline = pipeline_over(store.clone(), Some("whsec"));

    // Unsorted keys, odd spacing and a number f64 cannot hold exactly
    let body = "{\"event\":\"message.unsubscribed\",  \"event_id\":\"evt-r\",\n  \"data\":{\"message_id\":\"m1\",\"score\":0.10000000000000000001}}";
    let signature = sign(body.as_bytes(), b"whsec");
    let report = pipeline
        .ingest(Provider::Messaging, body.as_bytes(), Some(&signature))
        .await;
    assert!(report.success);

    let stored = store.get_event("evt-r").await.unwrap().unwrap();
    assert_eq!(stored.raw_payload, body);
    assert!(verify_signature(stored.raw_payload.as_bytes(), &signature, b"whsec"));
}

#[tokio::test]
async fn test_signature_enforced_when_configured() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline_over(store.clone(), Some("whsec"));
    let body = delivered_payload();

    let missing = pipeline.ingest(Provider::Messaging, &body, None).await;
    assert!(!missing.success);

    let forged = sign(&body, b"other-secret");
    let rejected = pipeline.ingest(Provider::Messaging, &body, Some(&forged)).await;
    assert!(!rejected.success);
    assert!(store.get_event("evt-100").await.unwrap().is_none());

    let valid = sign(&body, b"whsec");
    let accepted = pipeline.ingest(Provider::Messaging, &body, Some(&valid)).await;
    assert!(accepted.success);
    assert!(store.get_event("evt-100").await.unwrap().is_some());
}

#[tokio::test]
async fn test_actor_run_completes_enrichment_job() {
    let store = Arc::new(MemoryStore::new());
    let job = store
        .create_record(NewRecord {
            kind: RecordKind::EnrichmentJob,
            tenant_id: "acme".into(),
            reference: ObjectRef::new(ObjectType::Run, "run-1"),
            status: RecordStatus::Sent,
            sent_at: Some(Utc::now()),
        })
        .await
        .unwrap();
    let pipeline = pipeline_over(store.clone(), None);

    // No event id: the fallback id is derived from the payload
    let body = json!({
        "eventType": "ACTOR.RUN.SUCCEEDED",
        "createdAt": "2026-03-01T10:00:00Z",
        "eventData": {"actorRunId": "run-1"}
    })
    .to_string();

    let first = pipeline.ingest(Provider::Actor, body.as_bytes(), None).await;
    assert!(first.matched);
    let event_id = first.event_id.clone().unwrap();
    assert!(event_id.starts_with("derived-"));

    let record = store.get_record(&job.id).await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Completed);
    assert!(record.completed_at.is_some());

    let again = pipeline.ingest(Provider::Actor, body.as_bytes(), None).await;
    assert!(again.duplicate);
    assert_eq!(again.event_id, Some(event_id));
}

#[tokio::test]
async fn test_actor_run_timeout_fails_job() {
    let store = Arc::new(MemoryStore::new());
    let job = store
        .create_record(NewRecord {
            kind: RecordKind::EnrichmentJob,
            tenant_id: "acme".into(),
            reference: ObjectRef::new(ObjectType::Run, "run-2"),
            status: RecordStatus::Sent,
            sent_at: Some(Utc::now()),
        })
        .await
        .unwrap();
    let pipeline = pipeline_over(store.clone(), None);

    let body = json!({
        "eventType": "ACTOR.RUN.TIMED_OUT",
        "eventData": {"actorRunId": "run-2"},
        "resource": {"id": "run-2", "status": "TIMED-OUT"}
    })
    .to_string();
    pipeline.ingest(Provider::Actor, body.as_bytes(), None).await;

    let record = store.get_record(&job.id).await.unwrap().unwrap();
    assert_eq!(record.status, RecordStatus::Failed);
    assert_eq!(record.last_error.as_deref(), Some("TIMED-OUT"));
}

#[tokio::test]
async fn test_replay_after_record_appears() {
    let store = Arc::new(MemoryStore::new());
    let pipeline = pipeline_over(store.clone(), None);

    let report = pipeline.ingest(Provider::Messaging, &delivered_payload(), None).await;
    assert!(report.success);
    assert!(!report.matched);

    let record_id = campaign_lead(store.as_ref(), "m1", RecordStatus::Sent).await;
    let replay = pipeline.replay_unmatched(50).await.unwrap();
    assert_eq!(replay.examined, 1);
    assert_eq!(replay.matched, 1);

    let stored = store.get_event("evt-100").await.unwrap().unwrap();
    assert!(stored.matched);
    assert_eq!(stored.matched_record_id.as_deref(), Some(record_id.as_str()));
    assert_eq!(store.audit_trail(&record_id).await.unwrap()[0].event_id, "evt-100");
}
