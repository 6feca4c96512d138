use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::model::{BookingStatus, PaymentUpdate};

const REAP_INTERVAL: Duration = Duration::from_secs(60);
const COMPACT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

/// Reason stored on bookings whose checkout was never completed.
pub const EXPIRED_REASON: &str = "EXPIRED";

/// Background task that fails direct bookings stuck in `pending` longer
/// than `ttl`, releasing their days.
pub async fn run_reaper(engine: Arc<Engine>, ttl: chrono::Duration) {
    let mut interval = tokio::time::interval(REAP_INTERVAL);
    loop {
        interval.tick().await;
        reap_once(&engine, chrono::Utc::now(), ttl).await;
    }
}

/// One reaper pass. Returns the number of bookings expired.
pub async fn reap_once(engine: &Engine, now: chrono::DateTime<chrono::Utc>, ttl: chrono::Duration) -> usize {
    let mut reaped = 0;
    for id in engine.collect_expired_pending(now, ttl) {
        let update = PaymentUpdate {
            reason: Some(EXPIRED_REASON.into()),
            ..PaymentUpdate::status(BookingStatus::Failed)
        };
        match engine.apply_payment(id, update).await {
            Ok((_, crate::model::Transition::Applied)) => {
                info!("expired pending booking {id}");
                metrics::counter!(crate::observability::BOOKINGS_REAPED_TOTAL).increment(1);
                reaped += 1;
            }
            // Confirmed or failed meanwhile
            Ok(_) => {}
            Err(e) => tracing::debug!("reaper skip {id}: {e}"),
        }
    }
    reaped
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_CHECK_INTERVAL);
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends < threshold {
            continue;
        }
        match engine.compact_wal().await {
            Ok(()) => info!("compacted WAL after {appends} appends"),
            Err(e) => tracing::error!("WAL compaction failed: {e}"),
        }
    }
}
