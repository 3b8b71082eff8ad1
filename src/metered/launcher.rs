//! External job launcher.
//!
//! Metered actions start a run on the actor platform. The launcher is a trait
//! so the orchestrator and HTTP layer can be exercised without the network.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument};
use url::Url;

use crate::config::AppConfig;
use crate::ledger::{CreditKind, IdempotencyToken, TenantId};

/// Paid actions exposed under `/actions/{action}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MeteredAction {
    LeadSearch,
    PhoneReveal,
}

impl MeteredAction {
    /// Path segment form
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LeadSearch => "lead-search",
            Self::PhoneReveal => "phone-reveal",
        }
    }

    /// Credit kind consumed by this action
    pub fn credit_kind(&self) -> CreditKind {
        match self {
            Self::LeadSearch => CreditKind::LeadSearch,
            Self::PhoneReveal => CreditKind::PhoneReveal,
        }
    }

    /// Credits charged per unit, from configuration
    pub fn unit_cost(&self, config: &AppConfig) -> u64 {
        match self {
            Self::LeadSearch => config.lead_search_cost,
            Self::PhoneReveal => config.phone_reveal_cost,
        }
    }
}

impl fmt::Display for MeteredAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MeteredAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lead-search" | "lead_search" => Ok(Self::LeadSearch),
            "phone-reveal" | "phone_reveal" => Ok(Self::PhoneReveal),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

/// What to launch
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    pub action: MeteredAction,
    pub tenant_id: TenantId,
    /// Token of the debit paying for this run
    pub token: IdempotencyToken,
    /// Actor input, passed through unchanged
    pub input: Value,
}

/// A run accepted by the actor platform
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRun {
    pub run_id: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
}

/// Starts external jobs
#[async_trait::async_trait]
pub trait JobLauncher: Send + Sync {
    /// Start a run. Any error, including a non-2xx answer or a malformed
    /// body, means the run must be treated as not started.
    async fn launch(&self, request: &LaunchRequest) -> anyhow::Result<JobRun>;
}

/// Actor platform HTTP client
#[derive(Debug, Clone)]
pub struct ActorClient {
    http: reqwest::Client,
    base_url: Url,
    api_token: Option<String>,
    lead_search_actor: String,
    phone_reveal_actor: String,
}

impl ActorClient {
    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.external_timeout + Duration::from_secs(1))
            .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http,
            base_url: config.actor_api_url.clone(),
            api_token: config.actor_api_token.clone(),
            lead_search_actor: config.lead_search_actor.clone(),
            phone_reveal_actor: config.phone_reveal_actor.clone(),
        })
    }

    fn actor_for(&self, action: MeteredAction) -> &str {
        match action {
            MeteredAction::LeadSearch => &self.lead_search_actor,
            MeteredAction::PhoneReveal => &self.phone_reveal_actor,
        }
    }

    fn runs_url(&self, action: MeteredAction) -> anyhow::Result<Url> {
        let path = format!("v2/acts/{}/runs", self.actor_for(action));
        self.base_url
            .join(&path)
            .with_context(|| format!("Invalid actor path: {path}"))
    }
}

#[derive(Debug, Deserialize)]
struct RunEnvelope {
    data: RunData,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RunData {
    id: String,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    default_dataset_id: Option<String>,
}

/// Parse a run-creation response body
pub fn parse_run_response(body: &[u8]) -> anyhow::Result<JobRun> {
    let envelope: RunEnvelope =
        serde_json::from_slice(body).context("Malformed actor run response")?;
    if envelope.data.id.trim().is_empty() {
        bail!("Actor run response carried an empty run id");
    }
    Ok(JobRun {
        run_id: envelope.data.id,
        status: envelope.data.status.unwrap_or_else(|| "READY".to_string()),
        dataset_id: envelope.data.default_dataset_id,
    })
}

#[async_trait::async_trait]
impl JobLauncher for ActorClient {
    #[instrument(skip_all, fields(action = %request.action, tenant_id = %request.tenant_id))]
    async fn launch(&self, request: &LaunchRequest) -> anyhow::Result<JobRun> {
        let url = self.runs_url(request.action)?;

        let mut builder = self
            .http
            .post(url)
            .header("x-idempotency-token", request.token.as_str())
            .json(&request.input);
        if let Some(token) = &self.api_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.context("Actor platform unreachable")?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .context("Failed to read actor platform response")?;

        if !status.is_success() {
            let snippet: String = String::from_utf8_lossy(&body).chars().take(200).collect();
            bail!("Actor platform returned {status}: {snippet}");
        }

        let run = parse_run_response(&body)?;
        debug!(run_id = %run.run_id, status = %run.status, "Actor run started");
        Ok(run)
    }
}
