//! Health, status and metrics endpoints.
//!
//! - `GET /health` - liveness, always 200 while the process answers
//! - `GET /ready` - readiness, 503 when the store cannot be read
//! - `GET /status` - JSON summary of counters and request latency
//! - `GET /metrics` - Prometheus text
//!
//! # Example Response (`/status`)
//!
//! ```json
//! {
//!   "name": "leadflow-core",
//!   "version": "0.1.0",
//!   "status": "running",
//!   "uptime_seconds": 3600,
//!   "webhooks": { "received": 120, "matched": 97, "unmatched": 20, "duplicate": 3, "rejected": 0, "errors": 0 },
//!   "actions": { "succeeded": 40, "insufficient": 2, "rolled_back": 1, "rollback_failures": 0, "store_unavailable": 0 },
//!   "latency": { "p50_ms": 4.2, "p95_ms": 18.0, "p99_ms": 40.1, "total_requests": 180, "mean_ms": 6.3, "max_ms": 91.0 },
//!   "timestamp": "2026-01-01T12:00:00Z"
//! }
//! ```

use std::sync::atomic::Ordering;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::ledger::{CreditKind, TenantId};
use crate::metrics::LatencyMetrics;
use crate::server::AppState;

/// Server version from Cargo.toml
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Server name from Cargo.toml
pub const SERVER_NAME: &str = env!("CARGO_PKG_NAME");

/// Liveness/readiness body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
}

impl HealthResponse {
    fn new(status: &str) -> Self {
        Self {
            status: status.to_string(),
        }
    }
}

/// Webhook counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebhookCounters {
    pub received: u64,
    pub matched: u64,
    pub unmatched: u64,
    pub duplicate: u64,
    pub rejected: u64,
    pub errors: u64,
}

/// Metered action counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActionCounters {
    pub succeeded: u64,
    pub insufficient: u64,
    pub rolled_back: u64,
    pub rollback_failures: u64,
    pub store_unavailable: u64,
}

/// `/status` body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub name: String,
    pub version: String,
    /// Always "running" if responding
    pub status: String,
    pub uptime_seconds: u64,
    pub webhooks: WebhookCounters,
    pub actions: ActionCounters,
    pub latency: LatencyMetrics,
    /// RFC 3339
    pub timestamp: String,
}

/// `GET /health`
#[instrument(skip_all)]
pub async fn health_handler() -> impl IntoResponse {
    debug!("Health check requested");
    (StatusCode::OK, Json(HealthResponse::new("healthy")))
}

/// `GET /ready`
#[instrument(skip_all)]
pub async fn readiness_handler(State(state): State<AppState>) -> impl IntoResponse {
    let probe = TenantId::new("__readiness__");
    match state.quota.balance(&probe, CreditKind::LeadSearch).await {
        Ok(_) => (StatusCode::OK, Json(HealthResponse::new("ready"))),
        Err(e) => {
            warn!(error = %e, "Readiness probe failed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse::new("store_unavailable")),
            )
        }
    }
}

/// `GET /status`
#[instrument(skip_all)]
pub async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let m = &state.metrics;
    let load = |c: &std::sync::atomic::AtomicU64| c.load(Ordering::Relaxed);

    let response = StatusResponse {
        name: SERVER_NAME.to_string(),
        version: SERVER_VERSION.to_string(),
        status: "running".to_string(),
        uptime_seconds: m.uptime_seconds(),
        webhooks: WebhookCounters {
            received: load(&m.webhooks_received),
            matched: load(&m.webhooks_matched),
            unmatched: load(&m.webhooks_unmatched),
            duplicate: load(&m.webhooks_duplicate),
            rejected: load(&m.webhooks_rejected),
            errors: load(&m.webhooks_errors),
        },
        actions: ActionCounters {
            succeeded: load(&m.actions_succeeded),
            insufficient: load(&m.actions_insufficient),
            rolled_back: load(&m.actions_rolled_back),
            rollback_failures: load(&m.rollback_failures),
            store_unavailable: load(&m.store_unavailable),
        },
        latency: m.latency(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    (StatusCode::OK, Json(response))
}

/// `GET /metrics`
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.to_prometheus_format(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_response_serialization() {
        let response = StatusResponse {
            name: SERVER_NAME.to_string(),
            version: SERVER_VERSION.to_string(),
            status: "running".to_string(),
            uptime_seconds: 12,
            webhooks: WebhookCounters {
                received: 3,
                ..Default::default()
            },
            actions: ActionCounters::default(),
            latency: LatencyMetrics::default(),
            timestamp: "2026-01-01T00:00:00Z".to_string(),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["name"], "leadflow-core");
        assert_eq!(json["webhooks"]["received"], 3);
        assert_eq!(json["actions"]["rollback_failures"], 0);
    }
}
