use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::engine::Engine;
use crate::model::Ms;

fn now_ms() -> Ms {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_millis() as Ms
}

/// Background task that force-completes overdue Ongoing reservations and
/// archives Completed ones past the retention window. Reservations held open
/// by an approved extension have no effective end and are never touched.
pub async fn run_reaper(engine: Arc<Engine>, retention_ms: Ms) {
    let mut interval = tokio::time::interval(Duration::from_secs(5));
    loop {
        interval.tick().await;
        let now = now_ms();

        for (reservation_id, room_id) in engine.collect_overdue(now) {
            match engine.sweep_end(reservation_id, room_id, now).await {
                Ok(true) => info!("swept overdue reservation {reservation_id}"),
                Ok(false) => {} // ended or extended between scan and sweep
                Err(e) => tracing::debug!("sweep skip {reservation_id}: {e}"),
            }
        }

        for (reservation_id, room_id) in engine.collect_archivable(now, retention_ms) {
            match engine.sweep_archive(reservation_id, room_id, now).await {
                Ok(true) => info!("archived reservation {reservation_id}"),
                Ok(false) => {}
                Err(e) => tracing::debug!("archive skip {reservation_id}: {e}"),
            }
        }
    }
}

/// Background task that compacts the WAL once enough appends accumulate.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(Duration::from_secs(60));
    loop {
        interval.tick().await;
        let appends = engine.wal_appends_since_compact().await;
        if appends >= threshold {
            match engine.compact_wal().await {
                Ok(()) => info!("compacted WAL after {appends} appends"),
                Err(e) => tracing::warn!("WAL compaction failed: {e}"),
            }
        }
    }
}
