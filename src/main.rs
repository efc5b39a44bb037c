mod config;
mod falcon;
mod filter;
mod format;
mod intel;
mod mcp_api;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    routing::{get, post},
    Router,
};
use config::Config;
use falcon::{FalconClient, IntelQueries};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub intel: Arc<dyn IntelQueries>,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "falcon_intel_mcp=info,tower_http=info".into()),
        )
        .init();

    let config = Config::from_env()?;
    if config.api_key_is_fallback {
        warn!("FALCON_MCP_API_KEY not set; /mcp requests must use the generated fallback key");
    }

    let client = FalconClient::new(
        config.falcon_base_url.clone(),
        config.falcon_client_id.clone(),
        config.falcon_client_secret.clone(),
    );
    client
        .login()
        .await
        .context("Could not authenticate with the Falcon API")?;

    let state = AppState {
        config: config.clone(),
        intel: Arc::new(client),
    };

    let app = Router::new()
        .route("/healthz", get(mcp_api::healthz))
        .route("/mcp", post(mcp_api::mcp))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    info!("falcon-intel-mcp listening on {}", config.bind_addr);
    axum::serve(listener, app).await?;
    Ok(())
}
