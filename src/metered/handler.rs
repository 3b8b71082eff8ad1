//! `POST /actions/{action}`: charge, launch, refund on failure.

use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::MeteredActionError;
use crate::ledger::TenantId;
use crate::metered::launcher::{JobRun, LaunchRequest, MeteredAction};
use crate::metered::orchestrator::{AttemptState, MeteredRequest, MeteredSuccess};
use crate::server::AppState;
use crate::webhook::events::{ObjectRef, ObjectType};
use crate::webhook::records::{NewRecord, RecordKind, RecordStatus};

fn empty_input() -> Value {
    Value::Object(Default::default())
}

fn one() -> u64 {
    1
}

/// Action request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub tenant_id: String,
    /// Actor input, forwarded unchanged
    #[serde(default = "empty_input")]
    pub input: Value,
    /// Units to charge for; cost is `unit cost * quantity`
    #[serde(default = "one")]
    pub quantity: u64,
}

/// Successful action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionResponse {
    pub success: bool,
    pub run_id: String,
    pub idempotency_token: String,
    pub charged: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub balance: Option<u64>,
}

/// Failed action
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionErrorBody {
    pub success: bool,
    pub code: String,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_token: Option<String>,
}

impl ActionErrorBody {
    fn new(code: &str, error: impl Into<String>) -> Self {
        Self {
            success: false,
            code: code.to_string(),
            error: error.into(),
            idempotency_token: None,
        }
    }

    fn with_token(mut self, token: &str) -> Self {
        self.idempotency_token = Some(token.to_string());
        self
    }
}

fn bad_request(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ActionErrorBody::new("INVALID_REQUEST", message)),
    )
        .into_response()
}

/// Map an orchestrator error to status and body
pub fn error_response(err: &MeteredActionError) -> (StatusCode, ActionErrorBody) {
    match err {
        MeteredActionError::InsufficientCredits { .. } => (
            StatusCode::PAYMENT_REQUIRED,
            ActionErrorBody::new("INSUFFICIENT_CREDITS", err.to_string()),
        ),
        MeteredActionError::External { message, token } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ActionErrorBody::new("EXTERNAL_FAILURE", message.clone()).with_token(token),
        ),
        MeteredActionError::RollbackFailed { token, external, .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ActionErrorBody::new("ROLLBACK_FAILED", external.clone()).with_token(token),
        ),
        MeteredActionError::Ledger(e) if e.is_infrastructure() => (
            StatusCode::SERVICE_UNAVAILABLE,
            ActionErrorBody::new("STORE_UNAVAILABLE", "credit store unavailable"),
        ),
        MeteredActionError::Ledger(e) => (
            StatusCode::BAD_REQUEST,
            ActionErrorBody::new("INVALID_REQUEST", e.to_string()),
        ),
    }
}

/// Run a metered action
pub async fn run_action(
    State(state): State<AppState>,
    Path(action): Path<String>,
    body: Result<Json<ActionRequest>, JsonRejection>,
) -> Response {
    let action: MeteredAction = match action.parse() {
        Ok(action) => action,
        Err(e) => return bad_request(e),
    };
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => return bad_request(rejection.body_text()),
    };

    let tenant_id = TenantId::new(body.tenant_id.trim());
    if tenant_id.is_empty() {
        return bad_request("tenant_id is required");
    }
    if body.quantity == 0 {
        return bad_request("quantity must be at least 1");
    }
    let Some(amount) = action.unit_cost(&state.config).checked_mul(body.quantity) else {
        return bad_request("quantity too large");
    };

    let request = MeteredRequest {
        tenant_id: tenant_id.clone(),
        kind: action.credit_kind(),
        amount,
        description: format!("{action} x{}", body.quantity),
    };

    // Detached from the request: a client that disconnects mid-call must not
    // cancel the attempt between the debit and its rollback.
    let task = tokio::spawn(execute(state, action, request, body.input));
    match task.await {
        Ok(Ok(success)) => {
            info!(
                %action,
                tenant_id = %tenant_id,
                run_id = %success.value.run_id,
                charged = amount,
                "Metered action completed"
            );
            (
                StatusCode::OK,
                Json(ActionResponse {
                    success: true,
                    run_id: success.value.run_id,
                    idempotency_token: success.token.as_str().to_string(),
                    charged: amount,
                    balance: success.balance,
                }),
            )
                .into_response()
        }
        Ok(Err(e)) => {
            info!(
                %action,
                tenant_id = %tenant_id,
                state = AttemptState::of_error(&e).as_str(),
                error = %e,
                "Metered action not completed"
            );
            let (status, body) = error_response(&e);
            (status, Json(body)).into_response()
        }
        Err(e) => {
            error!(%action, tenant_id = %tenant_id, error = %e, "Metered action task aborted");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ActionErrorBody::new("INTERNAL_ERROR", "metered action aborted")),
            )
                .into_response()
        }
    }
}

/// Charge, launch and track the enrichment job. Runs to completion even when
/// the caller has gone away.
async fn execute(
    state: AppState,
    action: MeteredAction,
    request: MeteredRequest,
    input: Value,
) -> Result<MeteredSuccess<JobRun>, MeteredActionError> {
    let launcher = state.launcher.clone();
    let launch_tenant = request.tenant_id.clone();
    let tenant_id = request.tenant_id.clone();
    let success = state
        .orchestrator
        .run(request, move |token| async move {
            launcher
                .launch(&LaunchRequest {
                    action,
                    tenant_id: launch_tenant,
                    token,
                    input,
                })
                .await
        })
        .await?;

    let job = NewRecord {
        kind: RecordKind::EnrichmentJob,
        tenant_id,
        reference: ObjectRef::new(ObjectType::Run, success.value.run_id.clone()),
        status: RecordStatus::Sent,
        sent_at: Some(Utc::now()),
    };
    if let Err(e) = state.stores.records.create_record(job).await {
        warn!(run_id = %success.value.run_id, error = %e, "Run started but enrichment job not tracked");
    }
    Ok(success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LedgerError, StoreError};
    use crate::ledger::CreditKind;

    #[test]
    fn test_error_codes() {
        let cases = [
            (
                MeteredActionError::InsufficientCredits { kind: CreditKind::LeadSearch, required: 5 },
                StatusCode::PAYMENT_REQUIRED,
                "INSUFFICIENT_CREDITS",
            ),
            (
                MeteredActionError::External { message: "500".into(), token: "t".into() },
                StatusCode::INTERNAL_SERVER_ERROR,
                "EXTERNAL_FAILURE",
            ),
            (
                MeteredActionError::RollbackFailed {
                    token: "t".into(),
                    external: "500".into(),
                    rollback: "db".into(),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
                "ROLLBACK_FAILED",
            ),
            (
                MeteredActionError::Ledger(LedgerError::Store(StoreError::NotFound("x".into()))),
                StatusCode::SERVICE_UNAVAILABLE,
                "STORE_UNAVAILABLE",
            ),
            (
                MeteredActionError::Ledger(LedgerError::EmptyToken),
                StatusCode::BAD_REQUEST,
                "INVALID_REQUEST",
            ),
        ];
        for (err, status, code) in cases {
            let (got_status, body) = error_response(&err);
            assert_eq!(got_status, status);
            assert_eq!(body.code, code);
            assert!(!body.success);
        }
    }

    #[test]
    fn test_request_defaults() {
        let req: ActionRequest = serde_json::from_str(r#"{"tenant_id": "acme"}"#).unwrap();
        assert_eq!(req.quantity, 1);
        assert!(req.input.is_object());
    }
}
