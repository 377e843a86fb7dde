//! Prophet - peer-to-peer prediction market backend
//!
//! Usage:
//!   prophet --listen 0.0.0.0:3000 --db-path prophet.db
//!
//! Environment:
//!   JWT_SECRET - HMAC secret for bearer tokens (required)
//!   PROPHET_CONFIG_PATH - TOML config file (default: prophet.toml)
//!   OPENROUTER_API_KEY - enables AI arbitration together with the search keys
//!   GOOGLE_SEARCH_API_KEY / GOOGLE_SEARCH_ENGINE_ID - web search for AI arbitration

use anyhow::{bail, Context, Result};
use clap::Parser;
use dotenv::dotenv;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use prophet_backend::{
    api::{create_router, AppState},
    appeals::AppealService,
    comments::CommentService,
    arbitration::{Arbiter, GoogleSearchClient, OpenRouterClient},
    auth::JwtHandler,
    clock::{system_clock, Clock},
    config::AppConfig,
    credits::CreditService,
    ledger::LedgerDb,
    settlement::SettlementEngine,
};

#[derive(Parser, Debug)]
#[command(name = "prophet")]
#[command(about = "Prediction market ledger, settlement and AI arbitration service")]
struct Args {
    /// TOML config file; overrides PROPHET_CONFIG_PATH
    #[arg(long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "PROPHET_LISTEN_ADDR")]
    listen: Option<String>,

    /// SQLite ledger path
    #[arg(long, env = "PROPHET_DB_PATH")]
    db_path: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    load_env();
    init_tracing();

    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => {
            let mut cfg = AppConfig::load(path)?;
            cfg.apply_overrides(|key| std::env::var(key).ok());
            cfg
        }
        None => AppConfig::from_env(),
    };
    if let Some(listen) = args.listen {
        config.listen_addr = listen;
    }
    if let Some(db_path) = args.db_path {
        config.db_path = db_path;
    }
    if config.jwt_secret.trim().is_empty() {
        bail!("JWT_SECRET missing (set env var or jwt_secret in config)");
    }

    info!("🔮 Prophet backend starting");
    info!(db_path = %config.db_path, "opening ledger");

    let ledger = LedgerDb::open(&config.db_path)
        .with_context(|| format!("open ledger {}", config.db_path))?;
    let clock = system_clock();

    let http = reqwest::Client::builder()
        .build()
        .context("build http client")?;
    let arbiter = build_arbiter(&config, http, clock.clone(), ledger.clone());

    let jwt = Arc::new(
        JwtHandler::new(config.jwt_secret.clone())
            .with_expiration_hours(config.jwt_expiration_hours),
    );

    let state = AppState {
        engine: SettlementEngine::new(ledger.clone(), clock),
        credits: CreditService::new(ledger.clone()),
        appeals: AppealService::new(ledger.clone()),
        comments: CommentService::new(ledger),
        arbiter,
        jwt,
    };

    let app = create_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let listener = TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("bind {}", config.listen_addr))?;
    info!("🎯 API server listening on {}", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Prophet backend stopped");
    Ok(())
}

/// AI arbitration needs both a model and a search backend; without either the
/// arbitrate endpoint answers `AI_NOT_CONFIGURED`.
fn build_arbiter(
    config: &AppConfig,
    http: reqwest::Client,
    clock: Arc<dyn Clock>,
    ledger: LedgerDb,
) -> Option<Arc<Arbiter>> {
    let arb = &config.arbitration;

    let reasoning = match OpenRouterClient::from_env(
        http.clone(),
        arb.model.clone(),
        arb.temperature,
        arb.call_timeout(),
    ) {
        Ok(client) => client,
        Err(e) => {
            warn!("AI arbitration disabled: {:#}", e);
            return None;
        }
    };
    let search = match GoogleSearchClient::from_env(http, arb.call_timeout()) {
        Ok(client) => client,
        Err(e) => {
            warn!("AI arbitration disabled: {:#}", e);
            return None;
        }
    };

    info!(
        model = %arb.model,
        search_budget = arb.search_budget,
        timeout = ?arb.loop_timeout(),
        "⚖️ AI arbitration enabled"
    );
    Some(Arc::new(
        Arbiter::new(Arc::new(reasoning), Arc::new(search), clock, arb.clone()).with_ledger(ledger),
    ))
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "prophet_backend=debug,prophet=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

fn load_env() {
    // Standard dotenv search (cwd + parents)
    let _ = dotenv();

    // Also the crate root, for runs started from elsewhere
    let manifest_env = Path::new(env!("CARGO_MANIFEST_DIR")).join(".env");
    if manifest_env.exists() {
        let _ = dotenv::from_path(&manifest_env);
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
