use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::clock;
use crate::engine::Reclaimer;
use crate::store::JournaledStore;

/// Background task that reclaims unpaid reservations whose expiry job was
/// lost or never scheduled.
pub async fn run_sweeper(reclaimer: Reclaimer, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        let report = reclaimer.sweep(clock::now_ms()).await;
        if report.expired > 0 {
            info!(
                scanned = report.scanned,
                expired = report.expired,
                "expiry sweep reclaimed reservations"
            );
        } else {
            debug!(scanned = report.scanned, "expiry sweep found nothing due");
        }
    }
}

/// Background task that rewrites the journal once `threshold` appends have
/// accumulated since the last compaction.
pub async fn run_compactor(store: JournaledStore, threshold: u64, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        maybe_compact(&store, threshold).await;
    }
}

async fn maybe_compact(store: &JournaledStore, threshold: u64) -> bool {
    if store.appends_since_compact().await < threshold {
        return false;
    }
    match store.compact().await {
        Ok(()) => true,
        Err(e) => {
            error!("journal compaction failed: {e}");
            false
        }
    }
}
