use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error};

use crate::store::ResourceStore;

pub const COMPACT_INTERVAL: Duration = Duration::from_secs(10);

/// Background task that rewrites a tenant's claim log once it has grown past
/// `threshold` appends.
pub async fn run_compactor(store: Arc<ResourceStore>, threshold: u64) {
    let mut interval = tokio::time::interval(COMPACT_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;
        compact_once(&store, threshold).await;
    }
}

async fn compact_once(store: &ResourceStore, threshold: u64) -> bool {
    match store.compact_if_needed(threshold).await {
        Ok(done) => {
            if done {
                debug!(threshold, "compaction pass finished");
            }
            done
        }
        Err(e) => {
            // The old log is still intact; try again next tick.
            error!("compaction failed: {e}");
            false
        }
    }
}
