//! LRU crawler: tail-to-head sweeps that reclaim expired items, plus the
//! `lru_crawler metadump` listing.
//!
//! A sweep snapshots the chain under the LRU lock, then visits items one at
//! a time so stripe locks are held only briefly and the task stays
//! cancellable between items.

use super::item::{flags, ItemId};
use super::lru::Segment;
use super::CacheEngine;
use crate::stats::Stats;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

impl CacheEngine {
    /// Queue classes for a reclaim sweep (`lru_crawler crawl`). Returns
    /// false when the crawler is disabled.
    pub fn crawl_request(&self, classes: &[u8]) -> bool {
        if !self.crawler_enabled.load(Ordering::Relaxed) {
            return false;
        }
        let mut queue = self.crawler_queue.lock();
        for &cls in classes {
            if cls >= 1 && cls <= self.slabs().class_count() as u8 && !queue.contains(&cls) {
                queue.push(cls);
            }
        }
        drop(queue);
        self.crawler_signal.notify_one();
        true
    }

    /// All class ids, for `crawl all`.
    pub fn all_class_ids(&self) -> Vec<u8> {
        (1..=self.slabs().class_count() as u8).collect()
    }

    /// Snapshot every item on a class's chains, tail to head.
    fn snapshot_class(&self, cls: u8) -> Vec<ItemId> {
        let lru = self.lock_lru(cls);
        let mut ids = Vec::with_capacity(lru.total_count() as usize);
        for seg in Segment::ALL {
            let mut cursor = lru.tail(seg);
            while let Some(node) = cursor {
                ids.push(lru.node(node).item);
                cursor = lru.toward_head(node);
            }
        }
        ids
    }

    /// Reclaim expired/flushed items from one class, bounded by `tocrawl`
    /// (0 = whole chain), pausing `sleep_us` between items.
    pub async fn crawl_class(
        &self,
        cls: u8,
        tocrawl: u64,
        sleep_us: u32,
        shutdown: &CancellationToken,
    ) -> u64 {
        let ids = self.snapshot_class(cls);
        let limit = if tocrawl == 0 {
            ids.len() as u64
        } else {
            tocrawl
        };
        let mut reclaimed = 0u64;
        for (crawled, id) in ids.into_iter().enumerate() {
            if crawled as u64 >= limit || shutdown.is_cancelled() {
                break;
            }
            let now = self.clock().now();
            {
                let Some(mut stripe) = self.try_lock_stripe(id.stripe as usize) else {
                    continue;
                };
                let Some(rec) = stripe.get_item(id.slot) else {
                    continue;
                };
                if !rec.is_linked() || rec.refcount > 0 {
                    continue;
                }
                if rec.is_expired(now) || self.is_flushed(rec) {
                    let clsid = rec.clsid;
                    Stats::bump(&self.stats.reclaimed);
                    self.slabs()
                        .class(clsid)
                        .stats
                        .crawler_reclaimed
                        .fetch_add(1, Ordering::Relaxed);
                    let mut lru = self.lock_lru(clsid);
                    self.unlink_locked(&mut stripe, &mut lru, id.slot);
                    reclaimed += 1;
                }
            }
            if sleep_us > 0 {
                tokio::time::sleep(Duration::from_micros(sleep_us as u64)).await;
            }
        }
        reclaimed
    }

    /// `lru_crawler metadump`: one line of metadata per live item.
    pub fn metadump(&self, classes: &[u8]) -> Vec<u8> {
        let epoch = self.clock().epoch_start();
        let now = self.clock().now();
        let mut out = Vec::new();
        for &cls in classes {
            if cls < 1 || cls > self.slabs().class_count() as u8 {
                continue;
            }
            for id in self.snapshot_class(cls) {
                let stripe = self.lock_stripe(id.stripe as usize);
                let Some(rec) = stripe.get_item(id.slot) else {
                    continue;
                };
                if !rec.is_linked() || rec.is_expired(now) || self.is_flushed(rec) {
                    continue;
                }
                let exp = if rec.exptime == 0 {
                    -1
                } else {
                    epoch + rec.exptime as i64
                };
                let line = format!(
                    "key={} exp={} la={} cas={} fetch={} cls={} size={}\n",
                    url_encode(&rec.key),
                    exp,
                    epoch + rec.time as i64,
                    rec.cas,
                    if rec.it_flags & flags::FETCHED != 0 {
                        "yes"
                    } else {
                        "no"
                    },
                    rec.clsid,
                    super::item::item_total_size(
                        rec.key.len(),
                        rec.nbytes as usize,
                        self.settings().use_cas
                    ),
                );
                out.extend_from_slice(line.as_bytes());
            }
        }
        out.extend_from_slice(b"END\r\n");
        out
    }
}

/// Percent-encode everything outside the unreserved ASCII set.
fn url_encode(key: &[u8]) -> String {
    let mut out = String::with_capacity(key.len());
    for &b in key {
        if b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

/// Background crawler task: serves queued sweep requests.
pub async fn crawler_task(engine: Arc<CacheEngine>, shutdown: CancellationToken) {
    loop {
        let next = engine.crawler_queue.lock().pop();
        let Some(cls) = next else {
            tokio::select! {
                _ = engine.crawler_signal.notified() => continue,
                _ = shutdown.cancelled() => return,
            }
        };
        let tocrawl = engine.crawler_tocrawl.load(Ordering::Relaxed);
        let sleep_us = engine.crawler_sleep_us.load(Ordering::Relaxed);
        debug!(class = cls, "crawler sweep start");
        let reclaimed = engine
            .crawl_class(cls, tocrawl, sleep_us, &shutdown)
            .await;
        if reclaimed > 0 {
            info!(class = cls, reclaimed, "crawler reclaimed expired items");
        }
        if shutdown.is_cancelled() {
            return;
        }
    }
}
