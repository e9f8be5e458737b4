mod api;
mod auth;
mod chat;
mod config;
mod crypto;
mod engine;
mod error;
mod generation;
mod models;
mod nlq;
mod rate_limit;
mod scan;
mod store;

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use clap::{Parser, Subcommand};
use config::Config;
use crypto::CredentialCipher;
use engine::EngineRegistry;
use generation::ChatCompletionsGenerator;
use nlq::QueryEngine;
use rate_limit::RateLimiter;
use scan::{ScanContext, ScanRunner};
use store::Store;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "schemachat-api")]
#[command(about = "Schema graph scanning and natural-language SQL over registered databases")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP service (default)
    Serve,
    /// Print a fresh base64 credential encryption key and exit
    GenerateKey,
}

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Store,
    pub engines: Arc<EngineRegistry>,
    pub cipher: Arc<CredentialCipher>,
    pub scans: ScanRunner,
    pub query_engine: Arc<QueryEngine>,
    pub rate_limiter: Arc<RateLimiter>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    if let Some(Command::GenerateKey) = cli.command {
        let key = crypto::generate_key().context("Failed to generate encryption key")?;
        println!("{}", crypto::encode_key(&key));
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "schemachat_api=info,tower_http=info".into()),
        )
        .init();

    let config = Arc::new(Config::from_env()?);
    if config.api_key_is_fallback {
        warn!("Serving with a generated API key; set SCHEMACHAT_API_KEY to a stable value");
    }
    let state = build_state(Arc::clone(&config)).await?;
    scan::spawn_cleanup_worker(state.scans.records(), config.scan_retention_seconds);

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    info!("schemachat-api listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn build_state(config: Arc<Config>) -> Result<AppState> {
    let store = Store::open(config.database_path.clone())
        .await
        .with_context(|| format!("Failed to open store at {}", config.database_path.display()))?;
    let engines = Arc::new(EngineRegistry::with_defaults());
    let cipher = Arc::new(
        CredentialCipher::new(&config.encryption_key).context("Invalid encryption key")?,
    );
    let call_timeout = Duration::from_secs(config.external_call_timeout_seconds);

    let scans = ScanRunner::start(
        ScanContext {
            store: store.clone(),
            engines: Arc::clone(&engines),
            cipher: Arc::clone(&cipher),
            call_timeout,
        },
        config.queue_capacity,
    );

    let generator = Arc::new(ChatCompletionsGenerator::new(
        config.llm_base_url.clone(),
        config.llm_api_key.clone(),
        config.llm_model.clone(),
        config.external_call_timeout_seconds,
    ));
    let query_engine = Arc::new(QueryEngine::new(
        Arc::clone(&engines),
        Arc::clone(&cipher),
        generator,
        call_timeout,
        config.sql_top_k,
    ));

    info!(
        store = %store.path().display(),
        engines = ?engines.kinds(),
        "Service state ready"
    );

    Ok(AppState {
        rate_limiter: Arc::new(RateLimiter::new(
            config.chat_rate_limit_per_minute,
            config.chat_rate_limit_burst,
        )),
        config,
        store,
        engines,
        cipher,
        scans,
        query_engine,
    })
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(api::healthz))
        .route(
            "/v1/connections",
            post(api::create_connection).get(api::list_connections),
        )
        .route("/v1/connections/{connection_id}", get(api::get_connection))
        .route(
            "/v1/connections/{connection_id}/test",
            post(api::test_connection),
        )
        .route(
            "/v1/connections/{connection_id}/scan",
            post(api::trigger_scan),
        )
        .route("/v1/scans/{scan_id}", get(api::get_scan))
        .route("/v1/graph/{connection_id}", get(api::get_graph))
        .route(
            "/v1/chat/sessions",
            post(api::create_session).get(api::list_sessions),
        )
        .route("/v1/chat/sessions/{session_id}", get(api::get_session))
        .route(
            "/v1/chat/sessions/{session_id}/messages",
            post(api::post_message),
        )
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
