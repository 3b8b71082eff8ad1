//! Service configuration
//!
//! All settings come from environment variables; secrets are never read from
//! files or hardcoded.
//!
//! | Variable | Default |
//! |---|---|
//! | `LEADFLOW_DATABASE_PATH` | unset: in-memory store |
//! | `LEADFLOW_WEBHOOK_SECRET` | unset: signatures not checked |
//! | `LEADFLOW_SIGNATURE_HEADER` | `x-webhook-signature` |
//! | `LEADFLOW_ADMIN_TOKEN` | unset: admin routes disabled |
//! | `LEADFLOW_ACTOR_API_URL` | `https://api.apify.com` |
//! | `LEADFLOW_ACTOR_API_TOKEN` | unset |
//! | `LEADFLOW_LEAD_SEARCH_ACTOR` | `leadflow~lead-search` |
//! | `LEADFLOW_PHONE_REVEAL_ACTOR` | `leadflow~phone-reveal` |
//! | `LEADFLOW_EXTERNAL_TIMEOUT_SECS` | `30` |
//! | `LEADFLOW_ROLLBACK_RETRIES` | `3` |
//! | `LEADFLOW_LEAD_SEARCH_COST` | `1` |
//! | `LEADFLOW_PHONE_REVEAL_COST` | `1` |
//! | `LEADFLOW_ALLOWED_ORIGINS` | unset: localhost only |

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::{info, warn};
use url::Url;

use crate::error::ConfigError;

/// Default signature header
pub const DEFAULT_SIGNATURE_HEADER: &str = "x-webhook-signature";

/// Default actor platform base URL
pub const DEFAULT_ACTOR_API_URL: &str = "https://api.apify.com";

/// Runtime configuration
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// SQLite file; `None` keeps everything in memory
    pub database_path: Option<PathBuf>,

    /// Shared HMAC secret for inbound webhooks
    pub webhook_secret: Option<String>,

    /// Header carrying the webhook signature
    pub signature_header: String,

    /// Bearer token for admin routes
    pub admin_token: Option<String>,

    pub actor_api_url: Url,
    pub actor_api_token: Option<String>,
    pub lead_search_actor: String,
    pub phone_reveal_actor: String,

    /// Bound on each external call made by a metered action
    pub external_timeout: Duration,

    /// Rollback credit attempts before giving up
    pub rollback_retries: u32,

    /// Credits per lead search
    pub lead_search_cost: u64,

    /// Credits per phone reveal
    pub phone_reveal_cost: u64,

    /// Browser origins allowed by CORS, besides localhost
    pub allowed_origins: Vec<String>,
}

impl AppConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        let config = Self::from_lookup(|key| env::var(key).ok())?;
        config.log_summary();
        Ok(config)
    }

    /// Load through an arbitrary lookup (used by tests)
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let actor_api_url = get("LEADFLOW_ACTOR_API_URL")
            .unwrap_or_else(|| DEFAULT_ACTOR_API_URL.to_string());
        let actor_api_url = Url::parse(&actor_api_url).map_err(|source| ConfigError::InvalidUrl {
            var: "LEADFLOW_ACTOR_API_URL".to_string(),
            source,
        })?;

        let external_timeout_secs: u64 = parse_var(&get, "LEADFLOW_EXTERNAL_TIMEOUT_SECS", 30)?;
        if external_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                var: "LEADFLOW_EXTERNAL_TIMEOUT_SECS".to_string(),
                message: "timeout cannot be 0".to_string(),
            });
        }

        let rollback_retries: u32 = parse_var(&get, "LEADFLOW_ROLLBACK_RETRIES", 3)?;
        let lead_search_cost: u64 = parse_var(&get, "LEADFLOW_LEAD_SEARCH_COST", 1)?;
        let phone_reveal_cost: u64 = parse_var(&get, "LEADFLOW_PHONE_REVEAL_COST", 1)?;
        for (var, cost) in [
            ("LEADFLOW_LEAD_SEARCH_COST", lead_search_cost),
            ("LEADFLOW_PHONE_REVEAL_COST", phone_reveal_cost),
        ] {
            if cost == 0 {
                return Err(ConfigError::InvalidValue {
                    var: var.to_string(),
                    message: "cost must be at least 1".to_string(),
                });
            }
        }

        Ok(Self {
            database_path: get("LEADFLOW_DATABASE_PATH").map(PathBuf::from),
            webhook_secret: get("LEADFLOW_WEBHOOK_SECRET"),
            signature_header: get("LEADFLOW_SIGNATURE_HEADER")
                .unwrap_or_else(|| DEFAULT_SIGNATURE_HEADER.to_string()),
            admin_token: get("LEADFLOW_ADMIN_TOKEN"),
            actor_api_url,
            actor_api_token: get("LEADFLOW_ACTOR_API_TOKEN"),
            lead_search_actor: get("LEADFLOW_LEAD_SEARCH_ACTOR")
                .unwrap_or_else(|| "leadflow~lead-search".to_string()),
            phone_reveal_actor: get("LEADFLOW_PHONE_REVEAL_ACTOR")
                .unwrap_or_else(|| "leadflow~phone-reveal".to_string()),
            external_timeout: Duration::from_secs(external_timeout_secs),
            rollback_retries: rollback_retries.max(1),
            lead_search_cost,
            phone_reveal_cost,
            allowed_origins: get("LEADFLOW_ALLOWED_ORIGINS")
                .map(|v| {
                    v.split(',')
                        .map(|o| o.trim().to_string())
                        .filter(|o| !o.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        })
    }

    /// Configuration for tests: in-memory, no secrets, short timeouts
    pub fn test_config() -> Self {
        Self {
            database_path: None,
            webhook_secret: None,
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
            admin_token: Some("test-admin-token".to_string()),
            actor_api_url: Url::parse("http://127.0.0.1:9").expect("static URL is valid"),
            actor_api_token: None,
            lead_search_actor: "test~lead-search".to_string(),
            phone_reveal_actor: "test~phone-reveal".to_string(),
            external_timeout: Duration::from_millis(200),
            rollback_retries: 3,
            lead_search_cost: 5,
            phone_reveal_cost: 1,
            allowed_origins: Vec::new(),
        }
    }

    fn log_summary(&self) {
        match &self.database_path {
            Some(path) => info!(path = %path.display(), "Using SQLite store"),
            None => warn!("LEADFLOW_DATABASE_PATH not set, state is in-memory only"),
        }
        if self.webhook_secret.is_none() {
            warn!("SECURITY: LEADFLOW_WEBHOOK_SECRET not set, webhook signatures are NOT verified");
        }
        if self.admin_token.is_none() {
            warn!("LEADFLOW_ADMIN_TOKEN not set, admin routes will reject every request");
        }
        info!(
            timeout_secs = self.external_timeout.as_secs(),
            rollback_retries = self.rollback_retries,
            "Metered action policy"
        );
    }
}

fn parse_var<T, G>(get: &G, var: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        Some(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: var.to_string(),
            message: e.to_string(),
        }),
        None => Ok(default),
    }
}
