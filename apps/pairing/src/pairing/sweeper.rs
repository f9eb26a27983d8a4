use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{error, info};

use crate::pairing::service::PairingService;
use crate::pairing::store::PairingStore;

/// Deletes every pairing whose expiry is at or before `now`.
pub async fn sweep_expired(store: &dyn PairingStore, now: DateTime<Utc>) -> Result<u64> {
    store.delete_expired(now).await
}

/// Runs [`sweep_expired`] every `period` until the task is dropped.
/// Store errors are logged and retried on the next tick.
pub async fn run_expiry_sweeper(service: PairingService, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        match service.sweep_expired(Utc::now()).await {
            Ok(0) => {}
            Ok(removed) => info!("Removed {removed} expired extension pairings"),
            Err(e) => error!("Expired pairing sweep failed: {e:?}"),
        }
    }
}
