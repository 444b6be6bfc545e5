use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::engine::Engine;

/// Background task that flips reservations to done once their end time
/// passes. Finished reservations stop counting against quotas; the freed
/// time is in the past, so the waitlist is not consulted.
pub async fn run_sweeper(engine: Arc<Engine>) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_millis() as i64;
        let finished = engine.collect_finished(now);
        for (reservation_id, room_id) in finished {
            match engine.finish_reservation(reservation_id, room_id).await {
                Ok(true) => {
                    metrics::counter!(crate::observability::RESERVATIONS_SWEPT_TOTAL)
                        .increment(1);
                    info!("swept finished reservation {reservation_id}");
                }
                // May already have been cancelled — that's fine
                Ok(false) => debug!("sweeper skip {reservation_id}"),
                Err(e) => debug!("sweeper skip {reservation_id}: {e}"),
            }
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(30));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => {
                metrics::counter!(crate::observability::WAL_COMPACTIONS_TOTAL).increment(1);
                info!("compacted WAL after {appends} appends");
            }
            Err(e) => tracing::warn!("WAL compaction failed: {e}"),
        }
    }
}
