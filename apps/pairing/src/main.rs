use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use pairing::config::{Config, DEV_TOKEN_SECRET};
use pairing::db::create_pool;
use pairing::pairing::sweeper::run_expiry_sweeper;
use pairing::pairing::{PairingService, PairingStore, PgPairingStore};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting extension pairing service v{}", env!("CARGO_PKG_VERSION"));

    let db = create_pool(&config.database_url).await?;
    let store: Arc<dyn PairingStore> = Arc::new(PgPairingStore::new(db));

    if config.token_secret == DEV_TOKEN_SECRET {
        warn!("Extension tokens are signed with the development default secret; set EXTENSION_TOKEN_SECRET");
    }

    let service = PairingService::from_config(store, &config);
    info!(
        "Extension pairing ready (issuer={}, audience={})",
        config.token_issuer, config.token_audience
    );

    let period = Duration::from_secs(config.sweep_interval_secs.max(1));
    info!("Sweeping expired pairings every {}s", period.as_secs());

    tokio::select! {
        _ = run_expiry_sweeper(service, period) => {}
        result = tokio::signal::ctrl_c() => {
            result?;
            info!("Shutdown signal received");
        }
    }

    Ok(())
}
