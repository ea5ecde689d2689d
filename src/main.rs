mod api;
mod branch;
mod config;
mod db;
mod error;
mod git;
mod repo;

use std::sync::Arc;

use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use api::AppState;
use config::ServerConfig;

#[tokio::main]
async fn main() -> error::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "branch_sync_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env();

    // Initialize database
    let db_path = config.database_path();
    let db = Arc::new(db::init_database(&db_path).await?);
    tracing::info!("Database initialized at {:?}", db_path);

    let addr = config.bind_addr;
    let state = Arc::new(AppState::new(db, config));

    let repos = state.repos.list().await?;
    if repos.is_empty() {
        tracing::info!("No repositories yet");
    } else {
        tracing::info!("Loaded {} repositories from database", repos.len());
    }

    let app = api::api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    tracing::info!("Branch sync server starting on http://{}", addr);
    tracing::info!("  POST /api/repos/:owner/:repo/hooks/post-receive - Apply pushed ref updates");
    tracing::info!("  GET  /api/repos/:owner/:repo/consistency        - Compare branches with git");
    tracing::info!("  POST /api/repos/:owner/:repo/sync               - Repair branch records");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
