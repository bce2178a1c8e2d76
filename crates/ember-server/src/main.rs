use std::sync::Arc;

use tracing::{info, warn};

use ember_server::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ember=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;
    if config.uses_placeholder_secret() {
        warn!("EMBER_JWT_SECRET is unset or a placeholder; do not run this in production");
    }
    if config.allow_direct_conversations {
        info!("Direct conversations without a match are enabled");
    }

    // Init database
    let db = Arc::new(ember_db::Database::open(&config.db_path)?);

    let state = ember_server::build_state(&config, db);
    let app = ember_server::router(state);

    let addr = config.addr()?;
    info!("Ember server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
