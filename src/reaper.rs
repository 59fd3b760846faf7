//! Background liveness reaper.
//!
//! Subjects prove they are alive by pinging; this task periodically evicts
//! anyone whose window lapsed. With eviction disabled no task is spawned.

use crate::state::AppState;
use std::sync::Arc;
use std::time::Duration;

pub fn spawn_liveness_reaper(state: Arc<AppState>) {
    let Some(timeout) = state.config.kill_timeout else {
        tracing::info!("Liveness eviction disabled; unresponsive subjects are kept");
        return;
    };

    tokio::spawn(async move {
        let interval = Duration::from_millis(500).min(timeout);
        loop {
            tokio::time::sleep(interval).await;
            let evicted = state.core.lock().await.sweep_liveness();
            for id in evicted {
                tracing::debug!("Reaped unresponsive subject {}", id);
            }
        }
    });
}
