use tokio::time::{self, MissedTickBehavior};
use tracing::{info, warn};

use crate::{models::RefreshOutcome, AppState};

/// Periodically brings the cache up to date. The first check runs at once.
pub fn spawn_refresh_worker(state: AppState) {
    tokio::spawn(async move {
        let mut interval = time::interval(state.config.refresh_check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            match state.cache.ensure_fresh(false).await {
                Ok(RefreshOutcome::Skipped) => {}
                Ok(RefreshOutcome::Refreshed { rows, resets }) => {
                    info!(rows, resets, "Background refresh completed");
                }
                Err(err) => warn!("Background refresh failed, serving cached data: {err}"),
            }
        }
    });
}
