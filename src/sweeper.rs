use std::sync::Arc;
use std::time::Duration;

use crate::state::AppState;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Spawn a background task that evicts empty and abandoned sessions
pub fn spawn_session_sweeper(state: Arc<AppState>, empty_ttl: Duration, idle_ttl: Duration) {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(SWEEP_INTERVAL).await;

            match state.prune_idle_sessions(empty_ttl, idle_ttl).await {
                Ok(0) => {}
                Ok(evicted) => tracing::info!(evicted, "Swept idle sessions"),
                Err(e) => tracing::warn!("Session sweep failed: {}", e),
            }
        }
    });
}
