//! Ledger reconciliation service
//!
//! Admin CLI and HTTP API over the balance audit / fix / rollback engine.
//!
//! Usage:
//!   ledger-reconcile serve
//!   ledger-reconcile audit
//!   ledger-reconcile audit-user 0x52908400098527886e0f7030069857d2e4169ee7 --price 64000
//!   ledger-reconcile fix --all --source nightly
//!   ledger-reconcile rollback 42
//!   ledger-reconcile history --limit 20

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use ledger_reconcile::{
    api,
    reconcile::{FixRequest, Reconciler},
    LedgerDb, ReconcileConfig,
};
use rust_decimal::Decimal;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Balance reconciliation for the paper-trading ledger
#[derive(Parser, Debug)]
#[command(name = "ledger-reconcile")]
#[command(about = "Audit, fix and roll back user balances against the ledger")]
struct Cli {
    /// TOML config file (falls back to RECONCILE_CONFIG_PATH, then reconcile.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Recorded as the trigger of every run
    #[arg(long, env = "RECONCILE_TRIGGERED_BY", default_value = "cli")]
    triggered_by: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the admin HTTP API
    Serve,

    /// Audit every user
    Audit,

    /// Audit one user by id, username or wallet
    AuditUser {
        identifier: String,

        /// Current market price for unrealized P&L display
        #[arg(long)]
        price: Option<Decimal>,
    },

    /// Correct fixable balances
    Fix {
        /// Fix every fixable user
        #[arg(long, conflicts_with = "user")]
        all: bool,

        /// Restrict to these user ids
        #[arg(long = "user", num_args = 1..)]
        user: Vec<i64>,

        /// Where the fix was requested from
        #[arg(long, default_value = "cli")]
        source: String,
    },

    /// Undo a fix run
    Rollback { run_id: i64 },

    /// Show recent runs
    History {
        #[arg(short, long)]
        limit: Option<usize>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let cli = Cli::parse();
    let config = ReconcileConfig::from_env(cli.config.as_deref());
    let db = LedgerDb::new(&config.db_path)?;
    let reconciler = Reconciler::new(db, config);
    let by = cli.triggered_by.as_str();

    match cli.command {
        Commands::Serve => serve(reconciler).await?,
        Commands::Audit => print_json(&reconciler.run_full_audit(by)?)?,
        Commands::AuditUser { identifier, price } => {
            print_json(&reconciler.audit_user(&identifier, price, by)?)?
        }
        Commands::Fix { all, user, source } => {
            let request = FixRequest {
                fix_all: all,
                user_ids: (!user.is_empty()).then_some(user),
                triggered_by: by.to_string(),
                source,
            };
            print_json(&reconciler.apply_fix(&request)?)?
        }
        Commands::Rollback { run_id } => print_json(&reconciler.rollback(run_id, by)?)?,
        Commands::History { limit } => print_json(&reconciler.list_history(limit)?)?,
    }

    Ok(())
}

async fn serve(reconciler: Reconciler) -> Result<()> {
    let addr = reconciler.config().bind_addr.clone();
    info!(
        "💰 Starting grant {} cents, P&L rounding {}",
        reconciler.config().starting_grant_cents,
        reconciler.config().pnl_rounding.as_str()
    );

    let app = api::create_router(Arc::new(reconciler));

    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("🎯 Reconciliation API listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ledger_reconcile=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // Also the crate's own .env when run from elsewhere
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}
