//! Background maintenance: LRU juggling and hash-table expansion.

use crate::store::CacheEngine;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Maintainer sleep bounds; the loop backs off while idle.
const MAINTAINER_SLEEP_MIN: Duration = Duration::from_millis(50);
const MAINTAINER_SLEEP_MAX: Duration = Duration::from_secs(1);

/// Passes between automatic crawler dispatches.
const CRAWLS_EVERY: u32 = 60;

/// Buckets migrated per stripe per expander step.
const EXPAND_BATCH: usize = 64;

/// LRU maintainer: enforces segment caps and reclaims dead tails, sleeping
/// longer while there is nothing to do.
pub async fn lru_maintainer_task(engine: Arc<CacheEngine>, shutdown: CancellationToken) {
    info!("lru maintainer running");
    let mut sleep = MAINTAINER_SLEEP_MAX;
    let mut passes: u32 = 0;
    loop {
        tokio::select! {
            _ = tokio::time::sleep(sleep) => {}
            _ = shutdown.cancelled() => return,
        }
        let did = engine.lru_maintainer_pass();
        sleep = if did > 0 {
            MAINTAINER_SLEEP_MIN.max(sleep / 2)
        } else {
            MAINTAINER_SLEEP_MAX.min(sleep * 2)
        };
        passes = passes.wrapping_add(1);
        if passes % CRAWLS_EVERY == 0 && engine.crawler_enabled.load(Ordering::Relaxed) {
            let classes = engine.all_class_ids();
            engine.crawl_request(&classes);
        }
        if did > 0 {
            debug!(moved = did, "lru maintainer pass");
        }
    }
}

/// Hash expander: watches the load factor and migrates buckets in batches
/// once an expansion starts.
pub async fn hash_expander_task(engine: Arc<CacheEngine>, shutdown: CancellationToken) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.cancelled() => return,
        }
        if !engine.is_expanding() && !engine.maybe_start_expansion() {
            continue;
        }
        while !engine.expansion_step(EXPAND_BATCH) {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_millis(1)) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }
}
