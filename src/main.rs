//! Leadflow Core server and operator CLI.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use leadflow_core::ledger::{CreditKind, Direction, IdempotencyToken, MutationOutcome, TenantId};
use leadflow_core::metered::ActorClient;
use leadflow_core::server::{self, AppState};
use leadflow_core::store::Stores;
use leadflow_core::webhook::RecordStore;
use leadflow_core::AppConfig;

/// Leadflow webhook reconciliation and credit ledger
#[derive(Parser, Debug)]
#[command(name = "leadflow")]
#[command(author = "Leadflow Team <team@leadflow.dev>")]
#[command(version)]
#[command(about = "Webhook reconciliation and credit ledger service")]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// SQLite database file (overrides LEADFLOW_DATABASE_PATH)
    #[arg(short, long, global = true)]
    database: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "3001")]
        port: u16,

        /// Host to bind to
        #[arg(short = 'H', long, default_value = "127.0.0.1")]
        host: String,

        /// Keep all state in memory, ignoring any database path
        #[arg(long)]
        ephemeral: bool,
    },

    /// Re-reconcile stored unmatched webhook events
    Replay {
        /// Maximum events to examine
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },

    /// Grant credits to a tenant
    Grant {
        tenant: String,
        /// lead_search or phone_reveal
        kind: String,
        amount: u64,
        /// Idempotency token; reuse it to retry a grant safely
        #[arg(long)]
        token: Option<String>,
    },

    /// Show a tenant's balances
    Balance { tenant: String },

    /// Attribute a messaging-provider account to a tenant
    LinkAccount { account: String, tenant: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = AppConfig::from_env().context("Invalid configuration")?;
    if let Some(path) = cli.database {
        config.database_path = Some(path);
    }

    match cli.command {
        Command::Serve {
            port,
            host,
            ephemeral,
        } => {
            if ephemeral {
                config.database_path = None;
            }
            let state = build_state(config).await?;
            let addr: SocketAddr = format!("{host}:{port}")
                .parse()
                .with_context(|| format!("Invalid bind address {host}:{port}"))?;
            server::serve(state, addr).await
        }
        Command::Replay { limit } => {
            require_database(&config)?;
            let state = build_state(config).await?;
            let report = state.pipeline.replay_unmatched(limit).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Grant {
            tenant,
            kind,
            amount,
            token,
        } => {
            require_database(&config)?;
            let kind: CreditKind = kind.parse().map_err(anyhow::Error::msg)?;
            let state = build_state(config).await?;
            let tenant = TenantId::new(tenant);
            let token = token
                .map(IdempotencyToken::from)
                .unwrap_or_else(IdempotencyToken::generate);

            let outcome = state
                .quota
                .apply(&tenant, kind, Direction::Credit, amount, &token, "cli credit grant")
                .await?;
            println!(
                "{}",
                serde_json::json!({
                    "tenant_id": tenant,
                    "kind": kind,
                    "applied": matches!(outcome, MutationOutcome::Applied { .. }),
                    "balance": outcome.balance(),
                    "idempotency_token": token,
                })
            );
            Ok(())
        }
        Command::Balance { tenant } => {
            require_database(&config)?;
            let state = build_state(config).await?;
            let balances = state.quota.balances(&TenantId::new(tenant)).await?;
            println!("{}", serde_json::to_string_pretty(&balances)?);
            Ok(())
        }
        Command::LinkAccount { account, tenant } => {
            require_database(&config)?;
            let state = build_state(config).await?;
            let tenant = TenantId::new(tenant);
            state
                .stores
                .records
                .register_account(&account, &tenant)
                .await
                .context("Failed to link account")?;
            println!("Linked account {account} to tenant {tenant}");
            Ok(())
        }
    }
}

fn require_database(config: &AppConfig) -> anyhow::Result<()> {
    if config.database_path.is_none() {
        bail!("This command needs a database: pass --database or set LEADFLOW_DATABASE_PATH");
    }
    Ok(())
}

async fn build_state(config: AppConfig) -> anyhow::Result<AppState> {
    let stores = match &config.database_path {
        Some(path) => Stores::sqlite(path.clone())
            .await
            .with_context(|| format!("Failed to open database {}", path.display()))?,
        None => Stores::memory(),
    };
    let launcher = Arc::new(ActorClient::new(&config)?);
    Ok(AppState::new(config, stores, launcher))
}
