// 事件保留：后台周期清理过期事件。
use crate::store::Store;
use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const PURGE_TIMEOUT: Duration = Duration::from_secs(30);

/// Runs one purge immediately, then every `interval_hours` until cancelled.
pub fn spawn_retention_worker(
    store: Arc<dyn Store>,
    retention_days: i64,
    interval_hours: i64,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    let interval_hours = if interval_hours > 0 { interval_hours } else { 24 };

    tokio::spawn(async move {
        run_cycle(&store, retention_days).await;

        let mut ticker = tokio::time::interval(Duration::from_secs(interval_hours as u64 * 3600));
        // The first tick fires immediately and would double the initial run.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => run_cycle(&store, retention_days).await,
            }
        }
    })
}

async fn run_cycle(store: &Arc<dyn Store>, retention_days: i64) {
    let before = Utc::now() - ChronoDuration::days(retention_days);
    let store = store.clone();
    let purge = tokio::task::spawn_blocking(move || store.purge_events_before(before));

    match tokio::time::timeout(PURGE_TIMEOUT, purge).await {
        Ok(Ok(Ok(removed))) => {
            if removed > 0 {
                info!(removed, %before, "retention purged events");
            }
        }
        Ok(Ok(Err(err))) => warn!("retention purge failed: {err}"),
        Ok(Err(err)) => warn!("retention purge task failed: {err}"),
        Err(_) => warn!("retention purge timed out"),
    }
}
