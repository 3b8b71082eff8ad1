//! Admin endpoints, all behind the admin bearer token.
//!
//! - `POST /admin/credits` - grant credits
//! - `GET /balances/:tenant_id` - balances per kind
//! - `GET /balances/:tenant_id/history?kind=` - ledger history
//! - `POST /admin/webhooks/replay` - re-reconcile unmatched events
//! - `POST /admin/accounts` - map a messaging account to a tenant

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::error::LedgerError;
use crate::ledger::{
    CreditBalance, CreditKind, Direction, IdempotencyToken, LedgerEntry, MutationOutcome, TenantId,
};
use crate::server::AppState;
use crate::webhook::RecordStore;

/// Default number of events a replay examines
pub const DEFAULT_REPLAY_LIMIT: usize = 100;

fn error_body(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({"success": false, "code": code, "error": message.into()})),
    )
        .into_response()
}

fn ledger_error(e: LedgerError) -> Response {
    if e.is_infrastructure() {
        warn!(error = %e, "Admin request failed, store unavailable");
        error_body(StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE", "credit store unavailable")
    } else {
        error_body(StatusCode::BAD_REQUEST, "INVALID_REQUEST", e.to_string())
    }
}

/// Reject unless the request carries the admin token
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let auth_header = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let result = state.admin.authenticate(auth_header);
    if result.is_ok() {
        return Ok(());
    }

    let status = StatusCode::from_u16(result.status_code()).unwrap_or(StatusCode::UNAUTHORIZED);
    Err(error_body(
        status,
        "UNAUTHORIZED",
        result.error_message().unwrap_or("unauthorized"),
    ))
}

/// Credit grant request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantRequest {
    pub tenant_id: String,
    pub kind: String,
    pub amount: u64,
    /// Reuse to make a retried grant idempotent; fresh token when absent
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// Credit grant response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantResponse {
    pub success: bool,
    pub tenant_id: TenantId,
    pub kind: CreditKind,
    pub amount: u64,
    /// `false` when the token had already been used
    pub applied: bool,
    pub balance: u64,
    pub idempotency_token: String,
}

/// `POST /admin/credits`
pub async fn grant_credits(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<GrantRequest>, JsonRejection>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return error_body(StatusCode::BAD_REQUEST, "INVALID_REQUEST", rejection.body_text())
        }
    };
    let kind: CreditKind = match body.kind.parse() {
        Ok(kind) => kind,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, "INVALID_REQUEST", e),
    };

    let tenant = TenantId::new(body.tenant_id.trim());
    let token = body
        .token
        .map(IdempotencyToken::from)
        .unwrap_or_else(IdempotencyToken::generate);
    let description = body
        .description
        .unwrap_or_else(|| "admin credit grant".to_string());

    let outcome = match state
        .quota
        .apply(&tenant, kind, Direction::Credit, body.amount, &token, &description)
        .await
    {
        Ok(outcome) => outcome,
        Err(e) => return ledger_error(e),
    };

    let applied = matches!(outcome, MutationOutcome::Applied { .. });
    if applied {
        state.metrics.record_grant();
        info!(tenant_id = %tenant, %kind, amount = body.amount, "Credits granted");
    }

    (
        StatusCode::OK,
        Json(GrantResponse {
            success: true,
            tenant_id: tenant,
            kind,
            amount: body.amount,
            applied,
            balance: outcome.balance(),
            idempotency_token: token.as_str().to_string(),
        }),
    )
        .into_response()
}

/// Balance listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancesResponse {
    pub tenant_id: TenantId,
    pub balances: Vec<CreditBalance>,
}

/// `GET /balances/:tenant_id`
pub async fn get_balances(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let tenant = TenantId::new(tenant_id);
    match state.quota.balances(&tenant).await {
        Ok(balances) => (
            StatusCode::OK,
            Json(BalancesResponse {
                tenant_id: tenant,
                balances,
            }),
        )
            .into_response(),
        Err(e) => ledger_error(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub kind: String,
}

/// Ledger history listing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub tenant_id: TenantId,
    pub kind: CreditKind,
    pub entries: Vec<LedgerEntry>,
}

/// `GET /balances/:tenant_id/history?kind=`
pub async fn get_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(tenant_id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let kind: CreditKind = match query.kind.parse() {
        Ok(kind) => kind,
        Err(e) => return error_body(StatusCode::BAD_REQUEST, "INVALID_REQUEST", e),
    };
    let tenant = TenantId::new(tenant_id);
    match state.quota.history(&tenant, kind).await {
        Ok(entries) => (
            StatusCode::OK,
            Json(HistoryResponse {
                tenant_id: tenant,
                kind,
                entries,
            }),
        )
            .into_response(),
        Err(e) => ledger_error(e),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ReplayRequest {
    #[serde(default)]
    pub limit: Option<usize>,
}

/// `POST /admin/webhooks/replay`
///
/// The body is optional; `{}` or no body replays up to
/// [`DEFAULT_REPLAY_LIMIT`] events.
pub async fn replay_webhooks(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<ReplayRequest>>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let limit = body
        .and_then(|Json(b)| b.limit)
        .unwrap_or(DEFAULT_REPLAY_LIMIT)
        .max(1);

    match state.pipeline.replay_unmatched(limit).await {
        Ok(report) => (
            StatusCode::OK,
            Json(json!({"success": true, "replay": report})),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Replay failed");
            error_body(StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE", e.to_string())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountLink {
    pub account_id: String,
    pub tenant_id: String,
}

/// `POST /admin/accounts`
///
/// Later messaging webhooks for `account_id` are attributed to `tenant_id`.
/// Re-linking an account moves it to the new tenant.
pub async fn link_account(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<AccountLink>, JsonRejection>,
) -> Response {
    if let Err(denied) = authorize(&state, &headers) {
        return denied;
    }
    let Json(link) = match body {
        Ok(body) => body,
        Err(rejection) => {
            return error_body(StatusCode::BAD_REQUEST, "INVALID_REQUEST", rejection.body_text())
        }
    };
    let account_id = link.account_id.trim();
    let tenant = TenantId::new(link.tenant_id.trim());
    if account_id.is_empty() || tenant.is_empty() {
        return error_body(
            StatusCode::BAD_REQUEST,
            "INVALID_REQUEST",
            "account_id and tenant_id are required",
        );
    }

    match state.stores.records.register_account(account_id, &tenant).await {
        Ok(()) => {
            info!(account_id, tenant_id = %tenant, "Messaging account linked");
            (
                StatusCode::OK,
                Json(json!({"success": true, "account_id": account_id, "tenant_id": tenant})),
            )
                .into_response()
        }
        Err(e) => {
            warn!(error = %e, "Account link failed");
            error_body(StatusCode::SERVICE_UNAVAILABLE, "STORE_UNAVAILABLE", e.to_string())
        }
    }
}
