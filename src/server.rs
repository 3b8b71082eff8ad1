//! HTTP server wiring
//!
//! Everything a handler needs lives in [`AppState`], built once at startup.
//! There are no process-wide singletons: tests build as many independent
//! states as they like.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::AppConfig;
use crate::cors::cors_layer;
use crate::handlers::{admin, status};
use crate::ledger::QuotaConsumer;
use crate::metered::handler::run_action;
use crate::metered::{ActionPolicy, JobLauncher, Orchestrator};
use crate::metrics::Metrics;
use crate::security::AdminAuth;
use crate::store::Stores;
use crate::webhook::handler::{actor_webhook, messaging_webhook};
use crate::webhook::{Deduplicator, Reconciler, SignatureVerifier, WebhookPipeline};

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub stores: Stores,
    pub quota: QuotaConsumer,
    pub pipeline: WebhookPipeline,
    pub orchestrator: Orchestrator,
    pub launcher: Arc<dyn JobLauncher>,
    pub admin: AdminAuth,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// Wire every component from configuration, stores and a launcher
    pub fn new(config: AppConfig, stores: Stores, launcher: Arc<dyn JobLauncher>) -> Self {
        let policy = ActionPolicy::from_config(&config);
        Self::with_policy(config, stores, launcher, policy)
    }

    /// Same as [`AppState::new`] with an explicit action policy
    pub fn with_policy(
        config: AppConfig,
        stores: Stores,
        launcher: Arc<dyn JobLauncher>,
        policy: ActionPolicy,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());
        let quota = QuotaConsumer::new(stores.ledger.clone());

        let pipeline = WebhookPipeline::new(
            SignatureVerifier::new(config.webhook_secret.clone(), config.signature_header.clone()),
            Deduplicator::new(stores.events.clone()),
            Reconciler::new(stores.records.clone()),
            stores.records.clone(),
            metrics.clone(),
        );
        let orchestrator = Orchestrator::new(quota.clone(), policy, metrics.clone());
        let admin = AdminAuth::new(config.admin_token.as_deref());

        Self {
            config: Arc::new(config),
            stores,
            quota,
            pipeline,
            orchestrator,
            launcher,
            admin,
            metrics,
        }
    }
}

/// Record latency and status per matched route
async fn record_request(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());
    let start = Instant::now();

    let response = next.run(request).await;

    state
        .metrics
        .record_request(&route, response.status().as_u16(), start.elapsed());
    response
}

/// Build the full application router
pub fn build_router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.allowed_origins);

    Router::new()
        .route("/webhooks/messaging", post(messaging_webhook))
        .route("/webhooks/actor", post(actor_webhook))
        .route("/actions/:action", post(run_action))
        .route("/balances/:tenant_id", get(admin::get_balances))
        .route("/balances/:tenant_id/history", get(admin::get_history))
        .route("/admin/credits", post(admin::grant_credits))
        .route("/admin/webhooks/replay", post(admin::replay_webhooks))
        .route("/admin/accounts", post(admin::link_account))
        .route("/health", get(status::health_handler))
        .route("/ready", get(status::readiness_handler))
        .route("/status", get(status::status_handler))
        .route("/metrics", get(status::metrics_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), record_request))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Bind and serve until Ctrl-C
pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Leadflow core listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
