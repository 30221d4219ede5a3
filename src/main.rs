use std::net::SocketAddr;
use std::time::Duration;

use agora::config::{Cli, Config};
use agora::routes;
use agora::state::AppState;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // Parse CLI args and load config
    let cli = Cli::parse();
    let data_dir = Config::data_dir(&cli)?;
    std::fs::create_dir_all(&data_dir)?;
    tracing::info!("Data directory: {}", data_dir.display());

    let config = Config::load(&cli)?;
    if config.realtime.server_key.is_none() {
        tracing::warn!("No realtime server key configured, /ws is disabled");
    }

    // Database, migrations and services
    let state = AppState::initialize(config.clone())?;

    state.sessions.spawn_sweepers(
        Duration::from_secs(config.auth.sweep_interval_hours.max(1) * 3600),
        Duration::from_secs(config.auth.cache_sweep_secs.max(1)),
    );

    let app = routes::app(state);

    // Start server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    tracing::info!("Listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
