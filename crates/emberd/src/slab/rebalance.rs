//! Slab page rebalancing: drain one page of a source class and hand it to a
//! destination class, rescuing live items along the way.
//!
//! The rebalancer is a background task woken by `slabs reassign` or by the
//! automover. It never blocks the command path: item stripes are taken with
//! `try_lock` and contended slots are retried on the next pass.

use super::ChunkRef;
use crate::stats::Stats;
use crate::store::item::{flags, ValueLocation};
use crate::store::CacheEngine;
use crate::store::STAGED_OWNER;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Passes over a stubborn page before referenced items are force-evicted.
const MAX_BUSY_LOOPS: u32 = 40;

/// Sleep between passes over a page that still has busy items.
const BUSY_SLEEP: Duration = Duration::from_millis(50);

/// Automover sampling interval.
const AUTOMOVE_TICK: Duration = Duration::from_secs(1);

/// Outcome of a `slabs reassign` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReassignResult {
    Ok,
    /// A move is already in progress.
    Running,
    BadClass,
    /// Source has fewer than two pages.
    NoSpare,
    Same,
}

/// An in-progress page move.
#[derive(Debug, Clone)]
pub struct RebalancePlan {
    pub src: u8,
    pub dst: u8,
    pub page: u32,
    pub busy_items: u32,
    pub rescues: u64,
    pub chunk_rescues: u64,
    pub evictions_nomem: u64,
    pub inline_reclaim: u64,
    pub busy_deletes: u64,
    pub busy_loops: u32,
    pub done: bool,
}

/// Mailbox between the admin command, the automover, and the rebalancer.
#[derive(Debug, Default)]
pub struct RebalanceControl {
    pub plan: Option<RebalancePlan>,
}

impl CacheEngine {
    /// Handle `slabs reassign <src> <dst>`.
    pub fn slabs_reassign(&self, src: u8, dst: u8) -> ReassignResult {
        if !self.settings().slab_reassign {
            return ReassignResult::BadClass;
        }
        let count = self.slabs().class_count() as u8;
        if src < 1 || src > count || dst < 1 || dst > count {
            return ReassignResult::BadClass;
        }
        if src == dst {
            return ReassignResult::Same;
        }
        let mut control = self.rebalance.lock();
        if control.plan.is_some() {
            return ReassignResult::Running;
        }
        let page = {
            let inner = self.slabs().lock_class(src);
            if inner.page_count() < 2 {
                return ReassignResult::NoSpare;
            }
            match inner.pick_victim_page() {
                Some(page) => page,
                None => return ReassignResult::NoSpare,
            }
        };
        control.plan = Some(RebalancePlan {
            src,
            dst,
            page,
            busy_items: 0,
            rescues: 0,
            chunk_rescues: 0,
            evictions_nomem: 0,
            inline_reclaim: 0,
            busy_deletes: 0,
            busy_loops: 0,
            done: false,
        });
        drop(control);
        self.rebalance_signal.notify_one();
        info!(src, dst, page, "slab reassign requested");
        ReassignResult::Ok
    }

    /// One slot of the draining page. Returns false when the slot must be
    /// retried (busy).
    fn rebalance_slot(&self, chunk: ChunkRef, force: bool, plan: &mut RebalancePlan) -> bool {
        let owner = self.slabs().owner(chunk);
        let id = match owner {
            None => return true,
            Some(STAGED_OWNER) => {
                // A connection is still filling this chunk.
                plan.busy_items += 1;
                return false;
            }
            Some(id) => id,
        };

        let Some(mut stripe) = self.try_lock_stripe(id.stripe as usize) else {
            plan.busy_items += 1;
            return false;
        };
        // Re-check under the stripe lock; the item may have been freed and
        // the chunk re-owned in between.
        if self.slabs().owner(chunk) != Some(id) {
            return true;
        }
        let Some(rec) = stripe.get_item(id.slot) else {
            return true;
        };
        if !rec.location.chunks().any(|c| c == chunk) {
            return true;
        }

        if !rec.is_linked() {
            // Unlinked but pinned; the holder will free it shortly.
            plan.busy_items += 1;
            return false;
        }

        let now = self.clock().now();
        if rec.is_expired(now) {
            let clsid = rec.clsid;
            let mut lru = self.lock_lru(clsid);
            self.unlink_locked(&mut stripe, &mut lru, id.slot);
            plan.inline_reclaim += 1;
            return true;
        }

        if rec.refcount > 0 {
            if !force {
                plan.busy_items += 1;
                return false;
            }
            // Force mode after too many loops: treat the reference as leaked.
            stripe.item_mut(id.slot).refcount = 0;
            plan.busy_deletes += 1;
            let clsid = stripe.item(id.slot).clsid;
            let mut lru = self.lock_lru(clsid);
            self.unlink_locked(&mut stripe, &mut lru, id.slot);
            return true;
        }

        // Live, unreferenced: rescue by copying this one chunk elsewhere in
        // the same class. The restricted page is already off the freelist.
        match self.slabs().alloc(chunk.cls) {
            Some(new_chunk) => {
                self.slabs().copy_chunk(chunk, new_chunk);
                self.slabs().set_owner(new_chunk, Some(id));
                let rec = stripe.item_mut(id.slot);
                let mut was_body = false;
                match &mut rec.location {
                    ValueLocation::Single(slot_chunk) => {
                        *slot_chunk = new_chunk;
                    }
                    ValueLocation::Chunked { head, body } => {
                        if *head == chunk {
                            *head = new_chunk;
                        } else if let Some(entry) = body.iter_mut().find(|c| **c == chunk) {
                            *entry = new_chunk;
                            was_body = true;
                        }
                    }
                }
                self.slabs().free(chunk);
                if was_body {
                    plan.chunk_rescues += 1;
                } else {
                    plan.rescues += 1;
                }
                true
            }
            None => {
                // No memory to rescue into: the item is evicted.
                let fetched = stripe.item(id.slot).it_flags & flags::FETCHED != 0;
                let age = now.saturating_sub(stripe.item(id.slot).time);
                let clsid = stripe.item(id.slot).clsid;
                self.slabs().note_eviction(clsid, age, fetched);
                Stats::bump(&self.stats.evictions);
                let mut lru = self.lock_lru(clsid);
                self.unlink_locked(&mut stripe, &mut lru, id.slot);
                plan.evictions_nomem += 1;
                true
            }
        }
    }
}

/// Drive one page move to completion. Returns when the page has been handed
/// to the destination class or shutdown was requested.
async fn run_move(engine: &Arc<CacheEngine>, shutdown: &CancellationToken) {
    let Some(mut plan) = engine.rebalance.lock().plan.clone() else {
        return;
    };

    let perslab = {
        let mut inner = engine.slabs().lock_class(plan.src);
        if inner.restricted_page() != Some(plan.page) {
            inner.restrict_page(plan.page);
        }
        inner.perslab()
    };

    loop {
        plan.busy_items = 0;
        for slot in 0..perslab as u32 {
            let chunk = ChunkRef {
                cls: plan.src,
                page: plan.page,
                slot,
            };
            let force = plan.busy_loops >= MAX_BUSY_LOOPS;
            engine.rebalance_slot(chunk, force, &mut plan);
        }

        let remaining = {
            let inner = engine.slabs().lock_class(plan.src);
            inner.page(plan.page).used_slots()
        };
        if remaining == 0 && plan.busy_items == 0 {
            break;
        }

        plan.busy_loops += 1;
        // Publish progress for `stats slabs`.
        engine.rebalance.lock().plan = Some(plan.clone());
        if plan.busy_loops > MAX_BUSY_LOOPS + 2 {
            warn!(
                src = plan.src,
                busy = plan.busy_items,
                "rebalance stuck; forcing remaining items"
            );
        }
        tokio::select! {
            _ = tokio::time::sleep(BUSY_SLEEP) => {}
            _ = shutdown.cancelled() => return,
        }
    }

    // Page is empty: hand it over and re-carve.
    let block = {
        let mut inner = engine.slabs().lock_class(plan.src);
        inner.detach_restricted()
    };
    if let Some(block) = block {
        engine.slabs().transfer_page(plan.src, plan.dst, block);
        Stats::bump(&engine.stats.slabs_moved);
    }
    info!(
        src = plan.src,
        dst = plan.dst,
        rescues = plan.rescues,
        chunk_rescues = plan.chunk_rescues,
        evicted = plan.evictions_nomem,
        reclaimed = plan.inline_reclaim,
        busy_deletes = plan.busy_deletes,
        loops = plan.busy_loops,
        "slab page move complete"
    );
    engine.rebalance.lock().plan = None;
}

/// Background rebalancer: waits for reassign requests and drives them.
pub async fn rebalancer_task(engine: Arc<CacheEngine>, shutdown: CancellationToken) {
    loop {
        let has_plan = engine.rebalance.lock().plan.is_some();
        if !has_plan {
            tokio::select! {
                _ = engine.rebalance_signal.notified() => {}
                _ = shutdown.cancelled() => return,
            }
        }
        if shutdown.is_cancelled() {
            return;
        }
        run_move(&engine, &shutdown).await;
    }
}

/// Sliding-window eviction sampler driving automatic page moves.
struct AutomoveWindow {
    last_evicted: Vec<u64>,
    window: Vec<Vec<u64>>,
    cursor: usize,
}

impl AutomoveWindow {
    fn new(classes: usize, window_len: usize) -> Self {
        Self {
            last_evicted: vec![0; classes + 1],
            window: vec![vec![0; classes + 1]; window_len.max(1)],
            cursor: 0,
        }
    }

    /// Record this tick's eviction deltas.
    fn sample(&mut self, engine: &CacheEngine) {
        let classes = self.last_evicted.len() - 1;
        let slot = &mut self.window[self.cursor];
        for cls in 1..=classes {
            let evicted = engine
                .slabs()
                .class(cls as u8)
                .stats
                .evicted
                .load(Ordering::Relaxed);
            slot[cls] = evicted.saturating_sub(self.last_evicted[cls]);
            self.last_evicted[cls] = evicted;
        }
        self.cursor = (self.cursor + 1) % self.window.len();
    }

    /// Mean eviction rate per class over the window.
    fn rates(&self) -> Vec<f64> {
        let classes = self.last_evicted.len() - 1;
        let mut rates = vec![0.0; classes + 1];
        for slot in &self.window {
            for cls in 1..=classes {
                rates[cls] += slot[cls] as f64;
            }
        }
        let len = self.window.len() as f64;
        for rate in rates.iter_mut() {
            *rate /= len;
        }
        rates
    }
}

/// Pick (src, dst) for an automatic move, or None.
fn automove_decision(engine: &CacheEngine, rates: &[f64], aggressive: bool) -> Option<(u8, u8)> {
    let ratio = engine.settings().slab_automove_ratio;
    let classes = engine.slabs().class_count();

    // Destination: the class evicting hardest with a starved freelist.
    let mut dst: Option<(u8, f64)> = None;
    for cls in 1..=classes as u8 {
        let rate = rates[cls as usize];
        if rate <= 0.0 {
            continue;
        }
        let starved = {
            let inner = engine.slabs().lock_class(cls);
            inner.free_chunks() < inner.perslab()
        };
        if !starved && !aggressive {
            continue;
        }
        if dst.map(|(_, best)| rate > best).unwrap_or(true) {
            dst = Some((cls, rate));
        }
    }
    let (dst, dst_rate) = dst?;

    // Source: a spare-holding class whose rate the destination dwarfs.
    let mut src: Option<(u8, f64)> = None;
    for cls in 1..=classes as u8 {
        if cls == dst {
            continue;
        }
        let pages = engine.slabs().lock_class(cls).page_count();
        if pages < 2 {
            continue;
        }
        let rate = rates[cls as usize];
        if !aggressive && dst_rate * ratio <= rate {
            continue;
        }
        if src.map(|(_, best)| rate < best).unwrap_or(true) {
            src = Some((cls, rate));
        }
    }
    src.map(|(src, _)| (src, dst))
}

/// Background automover: samples eviction rates and requests page moves.
pub async fn automover_task(engine: Arc<CacheEngine>, shutdown: CancellationToken) {
    let mut window = AutomoveWindow::new(
        engine.slabs().class_count(),
        engine.settings().slab_automove_window as usize,
    );
    let mut tick = tokio::time::interval(AUTOMOVE_TICK);
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.cancelled() => return,
        }
        let level = engine.automove_level.load(Ordering::Relaxed);
        if level == 0 || !engine.settings().slab_reassign {
            continue;
        }
        window.sample(&engine);
        let rates = window.rates();
        if let Some((src, dst)) = automove_decision(&engine, &rates, level >= 2) {
            let result = engine.slabs_reassign(src, dst);
            if result == ReassignResult::Ok {
                debug!(src, dst, "automover requested page move");
            }
        }
    }
}
