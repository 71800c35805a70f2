use std::sync::Arc;
use std::time::Duration;

use chrono::Days;
use tracing::{debug, info, warn};

use crate::engine::Engine;

const RETENTION_INTERVAL: Duration = Duration::from_secs(3600);
const COMPACTION_INTERVAL: Duration = Duration::from_secs(30);

/// Purge finished appointments older than `retention_days`, once an hour.
pub async fn run_reaper(engine: Arc<Engine>, retention_days: u64) {
    let mut interval = tokio::time::interval(RETENTION_INTERVAL);
    loop {
        interval.tick().await;
        reap_once(&engine, retention_days).await;
    }
}

async fn reap_once(engine: &Engine, retention_days: u64) -> usize {
    let Some(cutoff) = chrono::Utc::now()
        .date_naive()
        .checked_sub_days(Days::new(retention_days))
    else {
        return 0;
    };
    match engine.purge_appointments(cutoff).await {
        Ok(0) => {
            debug!(%cutoff, "nothing to purge");
            0
        }
        Ok(n) => {
            info!(%cutoff, purged = n, "retention cleanup");
            n
        }
        Err(e) => {
            warn!("retention cleanup failed: {e}");
            0
        }
    }
}

/// Rewrite the WAL whenever `threshold` appends have piled up since the last rewrite.
pub async fn run_compactor(engine: Arc<Engine>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACTION_INTERVAL);
    loop {
        interval.tick().await;
        compact_if_due(&engine, threshold).await;
    }
}

async fn compact_if_due(engine: &Engine, threshold: u64) -> bool {
    let appends = engine.appends_since_compact().await;
    if appends < threshold {
        return false;
    }
    match engine.compact_wal().await {
        Ok(()) => {
            info!(appends, "WAL compacted");
            true
        }
        Err(e) => {
            warn!("WAL compaction failed: {e}");
            false
        }
    }
}
