//! # Parley Server
//!
//! Conversation server: REST operations, WebSocket sessions and long-poll.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! parley
//!
//! # Run with a specific config file
//! PARLEY_CONFIG=/path/to/parley.toml parley
//!
//! # Override settings from the environment
//! PARLEY__PORT=8080 PARLEY__DATABASE__PATH=/var/lib/parley/parley.db parley
//! ```

mod config;
mod error;
mod handlers;
mod metrics;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting Parley server on {}:{}", config.host, config.port);
    tracing::info!(
        database = %config.database.path,
        users = config.directory.users.len(),
        "Conversation store configured"
    );

    // Initialize metrics
    metrics::init_metrics();

    // Serve until shutdown, then drain background work
    handlers::run_server(config).await?;

    Ok(())
}
