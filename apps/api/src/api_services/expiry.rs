use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use super::StoreHandle;

/// Physically removes items whose storage expiry has passed.
///
/// Reads already hide expired items; the sweep only reclaims space.
pub fn spawn_expiry_sweeper(store: StoreHandle, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match store.purge_expired(Utc::now()).await {
                Ok(0) => {}
                Ok(purged) => debug!(purged, "purged expired store items"),
                Err(error) => warn!(error = %error, "failed to purge expired store items"),
            }
        }
    })
}
