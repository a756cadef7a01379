use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use partycards::{
    api, auth::AuthConfig, config::ServerConfig, state::AppState, store::MemoryStore, sweeper,
    types::GameRules,
};

#[tokio::main]
async fn main() {
    // Load .env file if present (before any env var reads)
    if let Err(e) = dotenvy::dotenv() {
        // Not an error if .env doesn't exist, only log if it's a different issue
        if !matches!(e, dotenvy::Error::Io(_)) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "partycards=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting partycards...");

    let server_config = ServerConfig::from_env();
    let auth_config = AuthConfig::from_env();
    let rules = GameRules::from_env();
    tracing::info!(?rules, "Game rules loaded");

    let pack = match server_config.load_pack() {
        Ok(pack) => pack,
        Err(e) => {
            tracing::error!("Failed to load card pack: {}", e);
            std::process::exit(1);
        }
    };

    let state = AppState::new(Arc::new(MemoryStore::new()), rules, auth_config);
    if let Err(e) = pack.seed(state.store.as_ref()).await {
        tracing::error!("Failed to seed card pack: {}", e);
        std::process::exit(1);
    }

    let state = Arc::new(state);
    sweeper::spawn_session_sweeper(
        state.clone(),
        server_config.empty_session_ttl,
        server_config.idle_session_ttl,
    );

    let app = api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr = server_config.bind_addr;
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!("Failed to bind {}: {}", addr, e);
            std::process::exit(1);
        }
    };
    tracing::info!("Listening on http://{}", addr);

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!("Server error: {}", e);
    }
}
