//! Periodic resource usage scraping.
//!
//! Mirrors the health loop but on a tighter interval, writing only the
//! stats field of each entry so the two loops never contend on meaning.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::supervisor::Supervisor;

/// Default scrape interval.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// One scrape over all supervised servers. Returns how many scrapes failed.
pub async fn metrics_pass(supervisor: &Supervisor) -> usize {
    let ids = supervisor.server_ids().await;
    let mut failures = 0;
    for id in ids {
        match supervisor.refresh_stats(&id).await {
            Ok(stats) => debug!(server_id = %id, cpu = stats.cpu_percent, "stats scraped"),
            Err(err) => {
                warn!(server_id = %id, %err, "stats scrape failed");
                failures += 1;
            }
        }
    }
    failures
}

/// Run the metrics loop until `shutdown` flips to true.
pub async fn run(
    supervisor: Arc<Supervisor>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(?interval, "metrics loop started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                metrics_pass(&supervisor).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("metrics loop stopping");
                    return;
                }
            }
        }
    }
}
