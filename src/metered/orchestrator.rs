//! Metered-action orchestrator.
//!
//! Wraps one paid external call in a pessimistic debit:
//!
//! ```text
//! Init ──debit──▶ Debited ──call ok──────────▶ ExternalOk
//!  │                 │
//!  │ insufficient    └──fail/timeout──▶ ExternalFailed ──credit(same token)──▶ RolledBack
//!  ▼                                          │
//! rejected, no external call                  └──retries exhausted──▶ manual reconciliation
//! ```
//!
//! The token is generated before anything else happens and is shared by the
//! debit and its rollback, so a rollback retried any number of times refunds
//! exactly once. No lock is held across the external call.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::config::AppConfig;
use crate::error::{LedgerError, MeteredActionError};
use crate::ledger::{CreditKind, Direction, IdempotencyToken, QuotaConsumer, TenantId};
use crate::metrics::{ActionOutcome, Metrics};

/// Lifecycle of one metered attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    Init,
    Debited,
    ExternalOk,
    ExternalFailed,
    RolledBack,
}

impl AttemptState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::Debited => "debited",
            Self::ExternalOk => "external_ok",
            Self::ExternalFailed => "external_failed",
            Self::RolledBack => "rolled_back",
        }
    }

    /// State an attempt ended in, given the error it surfaced
    pub fn of_error(error: &MeteredActionError) -> Self {
        match error {
            MeteredActionError::InsufficientCredits { .. } | MeteredActionError::Ledger(_) => {
                Self::Init
            }
            MeteredActionError::External { .. } => Self::RolledBack,
            MeteredActionError::RollbackFailed { .. } => Self::ExternalFailed,
        }
    }
}

/// Timeout and rollback retry policy
#[derive(Debug, Clone)]
pub struct ActionPolicy {
    /// Bound on the external call
    pub timeout: Duration,
    /// Rollback credit attempts, at least 1
    pub rollback_attempts: u32,
    /// Base delay between rollback attempts, grows linearly
    pub rollback_backoff: Duration,
}

impl ActionPolicy {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            timeout: config.external_timeout,
            rollback_attempts: config.rollback_retries.max(1),
            rollback_backoff: Duration::from_millis(100),
        }
    }

    /// Delay before rollback attempt `attempt` (0-based, first retry is 1)
    pub fn rollback_delay(&self, attempt: u32) -> Duration {
        self.rollback_backoff * attempt
    }
}

impl Default for ActionPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            rollback_attempts: 3,
            rollback_backoff: Duration::from_millis(100),
        }
    }
}

/// What to charge for
#[derive(Debug, Clone)]
pub struct MeteredRequest {
    pub tenant_id: TenantId,
    pub kind: CreditKind,
    pub amount: u64,
    pub description: String,
}

/// A completed, charged action
#[derive(Debug, Clone)]
pub struct MeteredSuccess<T> {
    pub value: T,
    pub token: IdempotencyToken,
    /// Balance right after the debit
    pub balance: Option<u64>,
}

/// Runs external calls behind a debit with rollback
#[derive(Clone)]
pub struct Orchestrator {
    quota: QuotaConsumer,
    policy: ActionPolicy,
    metrics: Arc<Metrics>,
}

impl Orchestrator {
    pub fn new(quota: QuotaConsumer, policy: ActionPolicy, metrics: Arc<Metrics>) -> Self {
        Self {
            quota,
            policy,
            metrics,
        }
    }

    pub fn policy(&self) -> &ActionPolicy {
        &self.policy
    }

    /// Debit, run `call` with the debit's token, roll back on failure.
    ///
    /// `call` runs under the policy timeout; an elapsed timeout counts as a
    /// failure even though the remote side may have done the work.
    #[instrument(
        skip_all,
        fields(tenant_id = %request.tenant_id, kind = %request.kind, amount = request.amount)
    )]
    pub async fn run<T, F, Fut>(
        &self,
        request: MeteredRequest,
        call: F,
    ) -> Result<MeteredSuccess<T>, MeteredActionError>
    where
        F: FnOnce(IdempotencyToken) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let token = IdempotencyToken::generate();

        let outcome = match self
            .quota
            .apply(
                &request.tenant_id,
                request.kind,
                Direction::Debit,
                request.amount,
                &token,
                &request.description,
            )
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                if e.is_infrastructure() {
                    self.metrics.record_action(ActionOutcome::StoreUnavailable);
                    warn!(token = %token, error = %e, "Debit failed, store unavailable");
                }
                return Err(e.into());
            }
        };

        if !outcome.accepted() {
            self.metrics.record_action(ActionOutcome::Insufficient);
            return Err(MeteredActionError::InsufficientCredits {
                kind: request.kind,
                required: request.amount,
            });
        }
        debug!(token = %token, state = AttemptState::Debited.as_str(), "Credits reserved");

        let external = match timeout(self.policy.timeout, call(token.clone())).await {
            Ok(Ok(value)) => {
                self.metrics.record_action(ActionOutcome::Succeeded);
                info!(token = %token, state = AttemptState::ExternalOk.as_str(), "Metered action succeeded");
                return Ok(MeteredSuccess {
                    value,
                    token,
                    balance: Some(outcome.balance()),
                });
            }
            Ok(Err(e)) => format!("{e:#}"),
            Err(_) => format!("external call timed out after {:?}", self.policy.timeout),
        };

        warn!(
            token = %token,
            state = AttemptState::ExternalFailed.as_str(),
            error = %external,
            "External call failed, rolling back debit"
        );
        Err(self.rollback(&request, token, external).await)
    }

    /// Refund a debit with its own token. Returns the error to surface.
    async fn rollback(
        &self,
        request: &MeteredRequest,
        token: IdempotencyToken,
        external: String,
    ) -> MeteredActionError {
        let description = format!("rollback: {}", request.description);
        let mut last_error: Option<LedgerError> = None;

        for attempt in 0..self.policy.rollback_attempts {
            if attempt > 0 {
                let delay = self.policy.rollback_delay(attempt);
                debug!(token = %token, attempt, delay_ms = delay.as_millis() as u64, "Retrying rollback");
                tokio::time::sleep(delay).await;
            }

            match self
                .quota
                .credit(&request.tenant_id, request.kind, request.amount, &token, &description)
                .await
            {
                Ok(_) => {
                    self.metrics.record_action(ActionOutcome::RolledBack);
                    info!(token = %token, state = AttemptState::RolledBack.as_str(), "Debit rolled back");
                    return MeteredActionError::External {
                        message: external,
                        token: token.as_str().to_string(),
                    };
                }
                Err(e) => {
                    warn!(token = %token, attempt = attempt + 1, error = %e, "Rollback attempt failed");
                    let retryable = e.is_infrastructure();
                    last_error = Some(e);
                    if !retryable {
                        break;
                    }
                }
            }
        }

        let rollback = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "no rollback attempted".to_string());
        self.metrics.record_action(ActionOutcome::RollbackFailed);
        error!(
            manual_reconciliation_required = true,
            tenant_id = %request.tenant_id,
            kind = %request.kind,
            amount = request.amount,
            token = %token,
            external_error = %external,
            rollback_error = %rollback,
            "Rollback failed, credits out of sync"
        );
        MeteredActionError::RollbackFailed {
            token: token.as_str().to_string(),
            external,
            rollback,
        }
    }
}
