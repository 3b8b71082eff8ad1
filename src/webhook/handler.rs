//! Webhook HTTP handlers
//!
//! Both endpoints answer 200 for every delivery, including rejected ones, so
//! providers never retry a payload we have already seen or can never accept.
//! The body says what happened. Ingestion runs on its own task, so a provider
//! that hangs up early does not cut reconciliation short.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use tracing::error;

use crate::server::AppState;
use crate::webhook::events::Provider;
use crate::webhook::pipeline::IngestReport;

/// `POST /webhooks/messaging`
pub async fn messaging_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<IngestReport>) {
    ingest(state, Provider::Messaging, &headers, body).await
}

/// `POST /webhooks/actor`
pub async fn actor_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<IngestReport>) {
    ingest(state, Provider::Actor, &headers, body).await
}

async fn ingest(
    state: AppState,
    provider: Provider,
    headers: &HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<IngestReport>) {
    let signature = headers
        .get(state.pipeline.verifier().header_name())
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let pipeline = state.pipeline.clone();
    let task = tokio::spawn(async move {
        pipeline
            .ingest(provider, &body, signature.as_deref())
            .await
    });
    let report = match task.await {
        Ok(report) => report,
        Err(e) => {
            error!(%provider, error = %e, "Webhook ingestion task aborted");
            IngestReport::aborted(e.to_string())
        }
    };
    (StatusCode::OK, Json(report))
}
