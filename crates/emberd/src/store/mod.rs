//! The item store: striped hash table, slab-backed items, segmented LRUs.
//!
//! All public operations lock in the order stripe → LRU → class. Paths that
//! discover work from an LRU tail (eviction, maintainer, rebalancer) meet
//! that order in reverse and therefore acquire the victim's stripe with
//! `try_lock`, skipping on contention.

pub mod crawler;
pub mod hash_table;
pub mod item;
pub mod lru;
mod snapshot;

use crate::clock::Clock;
use crate::config::Settings;
pub use crate::error::StoreError;
use crate::hashing;
use crate::slab::{rebalance::RebalanceControl, ChunkRef, SlabAllocator};
use crate::stats::Stats;
use hash_table::Stripe;
use item::{flags, item_total_size, ItemId, ItemMeta, ItemRec, ValueLocation, KEY_MAX_LENGTH};
use lru::{LruChains, Segment};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

/// Owner sentinel for chunks held by a staged (not yet committed) item.
pub const STAGED_OWNER: ItemId = ItemId {
    stripe: u32::MAX,
    slot: u32::MAX,
};

/// Eviction attempts before an allocation reports out-of-memory.
const ALLOC_PULL_ATTEMPTS: usize = 10;

/// Tail items examined per eviction attempt.
const EVICT_SEARCH_DEPTH: usize = 5;

/// Classic-LRU bump interval when the segmented LRU is off (seconds).
const ITEM_UPDATE_INTERVAL: u32 = 60;

/// Longest decimal value accepted by incr/decr (u64 is 20 digits).
const INCR_MAX_DIGITS: usize = 20;

/// Storage command verb, shared by both protocols.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Set,
    Add,
    Replace,
    Append,
    Prepend,
    Cas,
}

/// Result of a storage command. `Stored` carries the issued CAS so binary
/// responses can echo it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Stored { cas: u64 },
    NotStored,
    Exists,
    NotFound,
}

/// Result of incr/decr.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOutcome {
    Applied { value: u64, cas: u64 },
    NotFound,
    NonNumeric,
}

/// A pinned item reference: bumps the refcount on creation, releases on
/// drop. Holders may read the value at any time; a concurrent unlink keeps
/// the chunks alive until the last reference drops.
pub struct ItemRef {
    engine: Arc<CacheEngine>,
    pub meta: ItemMeta,
}

impl ItemRef {
    pub fn id(&self) -> ItemId {
        self.meta.id
    }

    /// Copy the value bytes out of the slab chunks.
    pub fn read_value(&self) -> Vec<u8> {
        self.engine.read_value(self.meta.id, self.meta.nbytes)
    }
}

impl Drop for ItemRef {
    fn drop(&mut self) {
        self.engine.release(self.meta.id);
    }
}

impl std::fmt::Debug for ItemRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemRef").field("meta", &self.meta).finish()
    }
}

/// An allocated-but-unlinked item being filled from the network.
pub struct StagedItem {
    engine: Arc<CacheEngine>,
    key: Vec<u8>,
    hv: u32,
    flags: u32,
    exptime: u32,
    nbytes: u32,
    clsid: u8,
    location: ValueLocation,
    written: usize,
    committed: bool,
}

impl StagedItem {
    pub fn nbytes(&self) -> u32 {
        self.nbytes
    }

    pub fn remaining(&self) -> usize {
        self.nbytes as usize - self.written
    }

    /// Append body bytes; the caller never exceeds `remaining()`.
    pub fn write(&mut self, bytes: &[u8]) {
        debug_assert!(bytes.len() <= self.remaining());
        match &self.location {
            ValueLocation::Single(chunk) => {
                self.engine.slabs.write(*chunk, self.written, bytes);
            }
            ValueLocation::Chunked { body, .. } => {
                let cap = self.engine.slabs.body_capacity();
                let mut offset = self.written;
                let mut rest = bytes;
                while !rest.is_empty() {
                    let idx = offset / cap;
                    let within = offset % cap;
                    let take = rest.len().min(cap - within);
                    self.engine.slabs.write(body[idx], within, &rest[..take]);
                    offset += take;
                    rest = &rest[take..];
                }
            }
        }
        self.written += bytes.len();
    }

    /// Link the filled item into the cache under `mode` semantics.
    pub fn commit(mut self, mode: StoreMode, req_cas: u64) -> StoreOutcome {
        debug_assert_eq!(self.remaining(), 0);
        self.committed = true;
        let engine = Arc::clone(&self.engine);
        engine.commit_store(self, mode, req_cas)
    }

    /// Copy back the bytes already streamed in (append/prepend path).
    fn read_back(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.written);
        match &self.location {
            ValueLocation::Single(chunk) => {
                self.engine.slabs.read_into(*chunk, 0, self.written, &mut out);
            }
            ValueLocation::Chunked { body, .. } => {
                let cap = self.engine.slabs.body_capacity();
                let mut remaining = self.written;
                for chunk in body {
                    let take = remaining.min(cap);
                    self.engine.slabs.read_into(*chunk, 0, take, &mut out);
                    remaining -= take;
                    if remaining == 0 {
                        break;
                    }
                }
            }
        }
        out
    }
}

impl Drop for StagedItem {
    fn drop(&mut self) {
        if !self.committed {
            for chunk in self.location.chunks() {
                self.engine.slabs.free(chunk);
            }
        }
    }
}

/// The cache engine: every shared structure behind its own lock, threaded
/// through the server and background tasks as one context.
pub struct CacheEngine {
    settings: Arc<Settings>,
    clock: Clock,
    pub stats: Stats,
    slabs: SlabAllocator,
    stripes: Vec<Mutex<Stripe>>,
    stripe_bits: u8,
    /// Indexed by class id; slot 0 unused.
    lrus: Vec<Mutex<LruChains>>,
    cas_id: AtomicU64,
    /// Flush watermark: items last touched at or before this are dead.
    oldest_live: AtomicU32,
    /// CAS watermark: with CAS on, items stored before the flush are dead.
    oldest_cas: AtomicU64,
    expanding: AtomicBool,
    /// Rebalancer mailbox and wakeup.
    pub rebalance: Mutex<RebalanceControl>,
    pub rebalance_signal: Notify,
    /// Crawler work queue (class ids) and wakeup.
    pub crawler_queue: Mutex<Vec<u8>>,
    pub crawler_signal: Notify,
    /// Runtime-adjustable knobs (mirrored from settings, mutable by admin
    /// commands).
    pub automove_level: AtomicU32,
    pub crawler_enabled: AtomicBool,
    pub crawler_sleep_us: AtomicU32,
    pub crawler_tocrawl: AtomicU64,
    pub verbosity: AtomicU32,
}

impl CacheEngine {
    pub fn new(settings: Arc<Settings>, clock: Clock) -> Arc<Self> {
        let stripe_bits = Self::stripe_bits_for(settings.num_threads, settings.hashpower());
        let stripe_count = 1usize << stripe_bits;
        let local_buckets = (1usize << settings.hashpower()) / stripe_count;

        let slabs = SlabAllocator::new(&settings);
        let class_count = slabs.class_count();

        let mut stripes = Vec::with_capacity(stripe_count);
        for _ in 0..stripe_count {
            stripes.push(Mutex::new(Stripe::new(local_buckets.max(1), stripe_bits)));
        }
        let mut lrus = Vec::with_capacity(class_count + 1);
        for _ in 0..=class_count {
            lrus.push(Mutex::new(LruChains::new()));
        }

        Arc::new(Self {
            stats: Stats::new(),
            slabs,
            stripes,
            stripe_bits,
            lrus,
            cas_id: AtomicU64::new(0),
            oldest_live: AtomicU32::new(0),
            oldest_cas: AtomicU64::new(0),
            expanding: AtomicBool::new(false),
            rebalance: Mutex::new(RebalanceControl::default()),
            rebalance_signal: Notify::new(),
            crawler_queue: Mutex::new(Vec::new()),
            crawler_signal: Notify::new(),
            automove_level: AtomicU32::new(settings.slab_automove as u32),
            crawler_enabled: AtomicBool::new(settings.lru_crawler),
            crawler_sleep_us: AtomicU32::new(settings.lru_crawler_sleep),
            crawler_tocrawl: AtomicU64::new(settings.lru_crawler_tocrawl),
            verbosity: AtomicU32::new(settings.verbose as u32),
            settings,
            clock,
        })
    }

    /// Lock-stripe sizing, scaled with the worker count but never beyond
    /// the bucket count.
    fn stripe_bits_for(num_threads: usize, hashpower: u8) -> u8 {
        let power: u8 = if num_threads < 3 {
            10
        } else if num_threads < 5 {
            11
        } else if num_threads < 9 {
            12
        } else {
            13
        };
        power.min(hashpower)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn slabs(&self) -> &SlabAllocator {
        &self.slabs
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    pub(crate) fn lock_stripe(&self, idx: usize) -> MutexGuard<'_, Stripe> {
        self.stripes[idx].lock()
    }

    pub(crate) fn try_lock_stripe(&self, idx: usize) -> Option<MutexGuard<'_, Stripe>> {
        self.stripes[idx].try_lock()
    }

    pub(crate) fn lock_lru(&self, cls: u8) -> MutexGuard<'_, LruChains> {
        self.lrus[cls as usize].lock()
    }

    #[inline]
    pub fn hash(&self, key: &[u8]) -> u32 {
        hashing::hash(self.settings.hash_algorithm, key)
    }

    #[inline]
    fn stripe_of(&self, hv: u32) -> usize {
        (hv as usize) & (self.stripes.len() - 1)
    }

    fn next_cas(&self) -> u64 {
        self.cas_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn current_cas(&self) -> u64 {
        self.cas_id.load(Ordering::Relaxed)
    }

    /// Total linked items across stripes.
    pub fn curr_items(&self) -> u64 {
        self.stripes.iter().map(|s| s.lock().item_count).sum()
    }

    /// Total bucket count across stripes.
    pub fn bucket_count(&self) -> usize {
        self.stripes.iter().map(|s| s.lock().bucket_count()).sum()
    }

    pub fn is_expanding(&self) -> bool {
        self.expanding.load(Ordering::Relaxed)
    }

    // ── flush watermarks ───────────────────────────────────────────────

    /// `flush_all`: kill everything stored before `when` (relative seconds;
    /// 0 = now). Items stored after the flush in the same second survive;
    /// same-second items stored before it are caught by the CAS watermark.
    pub fn flush_all(&self, when: u32) {
        let now = self.clock.now();
        let watermark = if when == 0 || when <= now { now } else { when };
        self.oldest_live
            .store(watermark.saturating_sub(1), Ordering::Relaxed);
        if self.settings.use_cas && watermark <= now {
            self.oldest_cas.store(self.current_cas(), Ordering::Relaxed);
        }
        Stats::bump(&self.stats.cmd_flush);
        debug!(watermark, "flush_all watermark set");
    }

    /// Dead by watermark: last touched at/before the flush point, or (with
    /// CAS on) stored before it. The CAS check stands on its own so a flush
    /// within the first second of uptime still takes effect.
    fn is_flushed(&self, rec: &ItemRec) -> bool {
        let oldest_live = self.oldest_live.load(Ordering::Relaxed);
        if oldest_live != 0 && oldest_live <= self.clock.now() && rec.time <= oldest_live {
            return true;
        }
        if self.settings.use_cas {
            let oldest_cas = self.oldest_cas.load(Ordering::Relaxed);
            oldest_cas != 0 && rec.cas != 0 && rec.cas <= oldest_cas
        } else {
            false
        }
    }

    // ── lookup ─────────────────────────────────────────────────────────

    /// `get`: pin and return the item, applying fetch promotion when
    /// `do_update`. Expired and flushed items are lazily unlinked.
    pub fn get(self: &Arc<Self>, key: &[u8], do_update: bool) -> Option<ItemRef> {
        self.get_with_new_expiry(key, do_update, None)
    }

    /// `touch`/`gat`: like `get` but also rewrites the expiry.
    pub fn touch(self: &Arc<Self>, key: &[u8], exptime: u32) -> Option<ItemRef> {
        self.get_with_new_expiry(key, true, Some(exptime))
    }

    fn get_with_new_expiry(
        self: &Arc<Self>,
        key: &[u8],
        do_update: bool,
        new_exptime: Option<u32>,
    ) -> Option<ItemRef> {
        if key.is_empty() || key.len() > KEY_MAX_LENGTH {
            return None;
        }
        let hv = self.hash(key);
        let now = self.clock.now();
        let mut stripe = self.lock_stripe(self.stripe_of(hv));
        self.nudge_migration(&mut stripe);

        let slot = stripe.find(hv, key)?;
        let id = ItemId {
            stripe: self.stripe_of(hv) as u32,
            slot,
        };

        // Lazy reclamation of dead items.
        let (expired, flushed) = {
            let rec = stripe.item(slot);
            (rec.is_expired(now), self.is_flushed(rec))
        };
        if expired || flushed {
            if expired {
                Stats::bump(&self.stats.get_expired);
            } else {
                Stats::bump(&self.stats.get_flushed);
            }
            let clsid = stripe.item(slot).clsid;
            let fetched = stripe.item(slot).it_flags & flags::FETCHED != 0;
            Stats::bump(&self.stats.reclaimed);
            let class_stats = &self.slabs.class(clsid).stats;
            class_stats.reclaimed.fetch_add(1, Ordering::Relaxed);
            if !fetched {
                class_stats.expired_unfetched.fetch_add(1, Ordering::Relaxed);
            }
            let mut lru = self.lock_lru(clsid);
            self.unlink_locked(&mut stripe, &mut lru, slot);
            return None;
        }

        // Pin before anything else can unlink it.
        let was_fetched = {
            let rec = stripe.item_mut(slot);
            rec.refcount += 1;
            if let Some(exptime) = new_exptime {
                rec.exptime = exptime;
            }
            rec.it_flags & flags::FETCHED != 0
        };

        if do_update {
            self.bump_locked(&mut stripe, slot, now);
        }

        let meta = {
            let rec = stripe.item(slot);
            self.slabs
                .class(rec.clsid)
                .stats
                .get_hits
                .fetch_add(1, Ordering::Relaxed);
            ItemMeta {
                id,
                flags: rec.flags,
                nbytes: rec.nbytes,
                cas: if self.settings.use_cas { rec.cas } else { 0 },
                clsid: rec.clsid,
                exptime: rec.exptime,
                time: rec.time,
                fetched: was_fetched,
            }
        };
        drop(stripe);
        Some(ItemRef {
            engine: Arc::clone(self),
            meta,
        })
    }

    /// Fetch promotion, mirroring the segmented-LRU rules.
    fn bump_locked(&self, stripe: &mut Stripe, slot: u32, now: u32) {
        let (clsid, node, it_flags, seg_update_due) = {
            let rec = stripe.item(slot);
            (
                rec.clsid,
                rec.lru_node,
                rec.it_flags,
                rec.time < now.saturating_sub(ITEM_UPDATE_INTERVAL),
            )
        };
        let Some(node) = node else { return };

        if !self.settings.lru_segmented {
            // Classic LRU: bump to head at most once per interval.
            if seg_update_due {
                let mut lru = self.lock_lru(clsid);
                let seg = lru.node(node).seg;
                lru.move_to_head(node, seg, now);
            }
            stripe.item_mut(slot).time = now;
            return;
        }

        let active = it_flags & flags::ACTIVE != 0;
        let fetched = it_flags & flags::FETCHED != 0;
        if !active {
            if fetched {
                let mut lru = self.lock_lru(clsid);
                let seg = lru.node(node).seg;
                match seg {
                    Segment::Hot => {
                        lru.move_to_head(node, Segment::Warm, now);
                        lru.moves_to_warm += 1;
                    }
                    Segment::Temp => {
                        // TEMP never promotes.
                    }
                    seg => {
                        lru.move_to_head(node, seg, now);
                        lru.moves_within_lru += 1;
                    }
                }
                let landed = lru.node(node).seg.index();
                lru.hits[landed] += 1;
                stripe.item_mut(slot).it_flags |= flags::ACTIVE;
            } else {
                stripe.item_mut(slot).it_flags |= flags::FETCHED;
            }
        }
        stripe.item_mut(slot).time = now;
    }

    /// Copy out an item's value. The caller holds a pinned reference.
    fn read_value(&self, id: ItemId, nbytes: u32) -> Vec<u8> {
        let stripe = self.lock_stripe(id.stripe as usize);
        let mut out = Vec::with_capacity(nbytes as usize);
        let Some(rec) = stripe.get_item(id.slot) else {
            return out;
        };
        match &rec.location {
            ValueLocation::Single(chunk) => {
                self.slabs.read_into(*chunk, 0, rec.nbytes as usize, &mut out);
            }
            ValueLocation::Chunked { body, .. } => {
                let cap = self.slabs.body_capacity();
                let mut remaining = rec.nbytes as usize;
                for chunk in body {
                    let take = remaining.min(cap);
                    self.slabs.read_into(*chunk, 0, take, &mut out);
                    remaining -= take;
                }
            }
        }
        out
    }

    /// Drop one reference; frees the chunks once an unlinked item loses its
    /// last holder.
    pub fn release(&self, id: ItemId) {
        let mut stripe = self.lock_stripe(id.stripe as usize);
        let Some(rec) = stripe.get_item_mut(id.slot) else {
            // Already torn down by tail repair.
            return;
        };
        debug_assert!(rec.refcount > 0);
        rec.refcount -= 1;
        if rec.refcount == 0 && !rec.is_linked() {
            self.free_unlinked(&mut stripe, id.slot);
        }
    }

    // ── allocation ─────────────────────────────────────────────────────

    /// Allocate an unlinked item sized for `nbytes` of value data. Evicts
    /// from the COLD tail when the budget is exhausted.
    pub fn alloc_staged(
        self: &Arc<Self>,
        key: &[u8],
        flags_user: u32,
        exptime: u32,
        nbytes: usize,
    ) -> Result<StagedItem, StoreError> {
        if key.is_empty() || key.len() > KEY_MAX_LENGTH {
            return Err(StoreError::TooLarge);
        }
        if nbytes > self.settings.item_size_max {
            return Err(StoreError::TooLarge);
        }
        let use_cas = self.settings.use_cas;
        let ntotal = item_total_size(key.len(), nbytes, use_cas);

        let (clsid, location) = match self.slabs.sizes().class_for(ntotal) {
            Some(cls) => {
                let chunk = match self.alloc_pull(cls) {
                    Some(chunk) => chunk,
                    None => {
                        self.note_oom(cls);
                        return Err(StoreError::OutOfMemory);
                    }
                };
                self.slabs.set_owner(chunk, Some(STAGED_OWNER));
                (cls, ValueLocation::Single(chunk))
            }
            None => {
                // Chained: head record accounted in a small class, body
                // chunks from the largest class, LRU identity on the latter.
                let body_cls = self.slabs.sizes().largest();
                let head_total = item_total_size(key.len(), 0, use_cas);
                let head_cls = self
                    .slabs
                    .sizes()
                    .class_for(head_total)
                    .unwrap_or(body_cls);
                let cap = self.slabs.body_capacity();
                let needed = nbytes.div_ceil(cap);

                let mut chunks: Vec<ChunkRef> = Vec::with_capacity(needed + 1);
                let head = match self.alloc_pull(head_cls) {
                    Some(chunk) => chunk,
                    None => {
                        self.note_oom(head_cls);
                        return Err(StoreError::OutOfMemory);
                    }
                };
                self.slabs.set_owner(head, Some(STAGED_OWNER));
                for _ in 0..needed {
                    match self.alloc_pull(body_cls) {
                        Some(chunk) => {
                            self.slabs.set_owner(chunk, Some(STAGED_OWNER));
                            chunks.push(chunk);
                        }
                        None => {
                            self.note_oom(body_cls);
                            self.slabs.free(head);
                            for chunk in chunks {
                                self.slabs.free(chunk);
                            }
                            return Err(StoreError::OutOfMemory);
                        }
                    }
                }
                (
                    body_cls,
                    ValueLocation::Chunked {
                        head,
                        body: chunks,
                    },
                )
            }
        };

        Ok(StagedItem {
            engine: Arc::clone(self),
            key: key.to_vec(),
            hv: self.hash(key),
            flags: flags_user,
            exptime,
            nbytes: nbytes as u32,
            clsid,
            location,
            written: 0,
            committed: false,
        })
    }

    fn note_oom(&self, cls: u8) {
        Stats::bump(&self.stats.outofmemory);
        self.slabs
            .class(cls)
            .stats
            .outofmemory
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Chunk allocation with eviction fallback: try the freelist/budget,
    /// then pull the class's COLD tail and retry.
    fn alloc_pull(&self, cls: u8) -> Option<ChunkRef> {
        for _ in 0..ALLOC_PULL_ATTEMPTS {
            if let Some(chunk) = self.slabs.alloc(cls) {
                return Some(chunk);
            }
            if !self.evict_from(cls) {
                return None;
            }
        }
        None
    }

    /// Evict one item from the class's COLD tail (TEMP first when enabled,
    /// single LRU when segmentation is off). Returns whether a chunk was
    /// freed.
    fn evict_from(&self, cls: u8) -> bool {
        let now = self.clock.now();
        let repair = self.settings.tail_repair();
        let mut lru = self.lock_lru(cls);

        // COLD first (TEMP ahead of it when enabled); fall back to HOT and
        // WARM so a class without maintainer demotion can still evict.
        for seg in [Segment::Temp, Segment::Cold, Segment::Hot, Segment::Warm] {
            let mut cursor = lru.tail(seg);
            let mut depth = 0;
            while let Some(node) = cursor {
                if depth >= EVICT_SEARCH_DEPTH {
                    break;
                }
                depth += 1;
                let id = lru.node(node).item;
                cursor = lru.toward_head(node);

                let Some(mut stripe) = self.try_lock_stripe(id.stripe as usize) else {
                    self.slabs
                        .class(cls)
                        .stats
                        .lrutail_reflocked
                        .fetch_add(1, Ordering::Relaxed);
                    continue;
                };
                let Some(rec) = stripe.get_item(id.slot) else {
                    continue;
                };
                if rec.lru_node != Some(node) || !rec.is_linked() {
                    continue;
                }
                if rec.refcount > 0 {
                    let leaked = repair != 0 && now.saturating_sub(rec.time) > repair;
                    if !leaked {
                        self.slabs
                            .class(cls)
                            .stats
                            .lrutail_reflocked
                            .fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    // Presumed leaked reference: reclaim it anyway.
                    Stats::bump(&self.stats.tailrepairs);
                    self.slabs
                        .class(cls)
                        .stats
                        .tailrepairs
                        .fetch_add(1, Ordering::Relaxed);
                    stripe.item_mut(id.slot).refcount = 0;
                }

                let rec = stripe.item(id.slot);
                let fetched = rec.it_flags & flags::FETCHED != 0;
                let dead = rec.is_expired(now) || self.is_flushed(rec);
                let age = now.saturating_sub(rec.time);
                if dead {
                    Stats::bump(&self.stats.reclaimed);
                    self.slabs
                        .class(cls)
                        .stats
                        .reclaimed
                        .fetch_add(1, Ordering::Relaxed);
                } else {
                    Stats::bump(&self.stats.evictions);
                    if !fetched {
                        Stats::bump(&self.stats.evicted_unfetched);
                    }
                    self.slabs.note_eviction(cls, age, fetched);
                }
                self.unlink_locked(&mut stripe, &mut lru, id.slot);
                return true;
            }
        }
        false
    }

    // ── store ──────────────────────────────────────────────────────────

    fn commit_store(self: &Arc<Self>, staged: StagedItem, mode: StoreMode, req_cas: u64) -> StoreOutcome {
        let hv = staged.hv;
        let stripe_idx = self.stripe_of(hv);
        let now = self.clock.now();

        let mut stripe = self.lock_stripe(stripe_idx);
        self.nudge_migration(&mut stripe);
        let existing = match stripe.find(hv, &staged.key) {
            Some(slot) => {
                let dead = {
                    let rec = stripe.item(slot);
                    rec.is_expired(now) || self.is_flushed(rec)
                };
                if dead {
                    // Lazily drop the corpse so the key stays unique.
                    let clsid = stripe.item(slot).clsid;
                    let mut lru = self.lock_lru(clsid);
                    self.unlink_locked(&mut stripe, &mut lru, slot);
                    None
                } else {
                    Some(slot)
                }
            }
            None => None,
        };

        match (mode, existing) {
            (StoreMode::Add, Some(slot)) => {
                // Keep the existing item warm, refuse the add.
                stripe.item_mut(slot).time = now;
                StoreOutcome::NotStored
            }
            (StoreMode::Replace, None) => StoreOutcome::NotStored,
            (StoreMode::Cas, None) => StoreOutcome::NotFound,
            (StoreMode::Cas, Some(slot)) if stripe.item(slot).cas != req_cas => {
                StoreOutcome::Exists
            }
            (StoreMode::Append, None) | (StoreMode::Prepend, None) => StoreOutcome::NotStored,
            (StoreMode::Append, Some(slot)) | (StoreMode::Prepend, Some(slot)) => {
                drop(stripe);
                self.concat_store(staged, mode, slot, stripe_idx)
            }
            (_, existing) => {
                let cas = self.link_new(&mut stripe, staged, existing, now);
                StoreOutcome::Stored { cas }
            }
        }
    }

    /// Append/prepend: build a combined item and swap it in. The original's
    /// flags and expiry are preserved.
    fn concat_store(
        self: &Arc<Self>,
        staged: StagedItem,
        mode: StoreMode,
        slot: u32,
        stripe_idx: usize,
    ) -> StoreOutcome {
        // Snapshot the existing value while pinned.
        let (old_value, old_flags, old_exptime, old_cas, key) = {
            let mut stripe = self.lock_stripe(stripe_idx);
            let Some(rec) = stripe.get_item_mut(slot) else {
                return StoreOutcome::NotStored;
            };
            if !rec.is_linked() || rec.key.as_ref() != staged.key.as_slice() {
                return StoreOutcome::NotStored;
            }
            rec.refcount += 1;
            let id = ItemId {
                stripe: stripe_idx as u32,
                slot,
            };
            let nbytes = rec.nbytes;
            let flags_user = rec.flags;
            let exptime = rec.exptime;
            let cas = rec.cas;
            let key = rec.key.to_vec();
            drop(stripe);
            let value = self.read_value(id, nbytes);
            self.release(id);
            (value, flags_user, exptime, cas, key)
        };

        let suffix = staged.read_back();
        drop(staged);

        let combined_len = old_value.len() + suffix.len();
        if combined_len > self.settings.item_size_max {
            return StoreOutcome::NotStored;
        }
        let mut combined = match self.alloc_staged(&key, old_flags, old_exptime, combined_len) {
            Ok(staged) => staged,
            Err(_) => return StoreOutcome::NotStored,
        };
        match mode {
            StoreMode::Append => {
                combined.write(&old_value);
                combined.write(&suffix);
            }
            _ => {
                combined.write(&suffix);
                combined.write(&old_value);
            }
        }
        // Swap in atomically against the snapshot when CAS is available.
        if self.settings.use_cas {
            match combined.commit(StoreMode::Cas, old_cas) {
                stored @ StoreOutcome::Stored { .. } => stored,
                _ => StoreOutcome::NotStored,
            }
        } else {
            combined.commit(StoreMode::Set, 0)
        }
    }

    /// Insert a filled record, unlinking any displaced item. Returns the
    /// CAS issued to the new item.
    fn link_new(
        &self,
        stripe: &mut Stripe,
        staged: StagedItem,
        displaced: Option<u32>,
        now: u32,
    ) -> u64 {
        let use_cas = self.settings.use_cas;
        let cas = if use_cas { self.next_cas() } else { 0 };
        let ntotal = item_total_size(staged.key.len(), staged.nbytes as usize, use_cas) as u32;

        if let Some(old_slot) = displaced {
            let clsid = stripe.item(old_slot).clsid;
            let mut lru = self.lock_lru(clsid);
            self.unlink_locked(stripe, &mut lru, old_slot);
        }

        // Dismantle the staged wrapper without releasing its chunks.
        let mut staged = staged;
        staged.committed = true;
        let key = std::mem::take(&mut staged.key);
        let location = staged.location.clone();
        let (hv, flags_user, exptime, nbytes, clsid) = (
            staged.hv,
            staged.flags,
            staged.exptime,
            staged.nbytes,
            staged.clsid,
        );
        drop(staged);

        let mut it_flags = flags::LINKED;
        if use_cas {
            it_flags |= flags::CAS;
        }
        if matches!(location, ValueLocation::Chunked { .. }) {
            it_flags |= flags::CHUNKED;
        }

        let rec = ItemRec {
            key: key.into_boxed_slice(),
            hv,
            flags: flags_user,
            exptime,
            time: now,
            nbytes,
            cas,
            clsid,
            it_flags,
            refcount: 0,
            h_next: None,
            lru_node: None,
            location: location.clone(),
        };
        let slot = stripe.alloc_slot(rec);
        stripe.insert(slot);

        let id = ItemId {
            stripe: self.stripe_of(hv) as u32,
            slot,
        };
        for chunk in location.chunks() {
            self.slabs.set_owner(chunk, Some(id));
        }

        let seg = self.admission_segment(exptime, now);
        let mut lru = self.lock_lru(clsid);
        let node = lru.push_head(seg, id, ntotal, now);
        drop(lru);
        stripe.item_mut(slot).lru_node = Some(node);

        Stats::bump(&self.stats.total_items);
        self.slabs
            .class(clsid)
            .stats
            .cmd_set
            .fetch_add(1, Ordering::Relaxed);
        cas
    }

    /// TEMP admission is evaluated before segmentation: short-TTL items go
    /// to TEMP even when the segmented LRU is off.
    fn admission_segment(&self, exptime: u32, now: u32) -> Segment {
        if self.settings.temp_lru
            && exptime != 0
            && exptime.saturating_sub(now) <= self.settings.temporary_ttl
        {
            Segment::Temp
        } else if self.settings.lru_segmented {
            Segment::Hot
        } else {
            Segment::Cold
        }
    }

    // ── delete / arithmetic ────────────────────────────────────────────

    /// `delete`: unlink the live item if present.
    pub fn delete(&self, key: &[u8]) -> bool {
        if key.is_empty() || key.len() > KEY_MAX_LENGTH {
            return false;
        }
        let hv = self.hash(key);
        let now = self.clock.now();
        let mut stripe = self.lock_stripe(self.stripe_of(hv));
        let Some(slot) = stripe.find(hv, key) else {
            return false;
        };
        let rec = stripe.item(slot);
        if rec.is_expired(now) || self.is_flushed(rec) {
            let clsid = rec.clsid;
            let mut lru = self.lock_lru(clsid);
            self.unlink_locked(&mut stripe, &mut lru, slot);
            return false;
        }
        let clsid = rec.clsid;
        let mut lru = self.lock_lru(clsid);
        self.unlink_locked(&mut stripe, &mut lru, slot);
        true
    }

    /// `incr`/`decr` per the classic rules: unsigned decimal values only,
    /// increment wraps at 2^64, decrement saturates at zero.
    pub fn add_delta(self: &Arc<Self>, key: &[u8], incr: bool, delta: u64) -> DeltaOutcome {
        let hv = self.hash(key);
        let now = self.clock.now();
        let stripe_idx = self.stripe_of(hv);
        let mut stripe = self.lock_stripe(stripe_idx);
        let Some(slot) = stripe.find(hv, key) else {
            return DeltaOutcome::NotFound;
        };
        {
            let rec = stripe.item(slot);
            if rec.is_expired(now) || self.is_flushed(rec) {
                let clsid = rec.clsid;
                let mut lru = self.lock_lru(clsid);
                self.unlink_locked(&mut stripe, &mut lru, slot);
                return DeltaOutcome::NotFound;
            }
        }

        let id = ItemId {
            stripe: stripe_idx as u32,
            slot,
        };
        let nbytes = stripe.item(slot).nbytes;
        drop(stripe);
        let raw = self.read_value(id, nbytes);
        let Some(value) = parse_decimal(&raw) else {
            return DeltaOutcome::NonNumeric;
        };
        let new_value = if incr {
            value.wrapping_add(delta)
        } else {
            value.saturating_sub(delta)
        };
        let text = new_value.to_string();

        let mut stripe = self.lock_stripe(stripe_idx);
        // Re-validate under the lock; the item may have moved meanwhile.
        let Some(rec) = stripe.get_item_mut(slot) else {
            return DeltaOutcome::NotFound;
        };
        if !rec.is_linked() || rec.key.as_ref() != key {
            return DeltaOutcome::NotFound;
        }
        if text.len() <= rec.nbytes as usize {
            let cas = if self.settings.use_cas {
                self.next_cas()
            } else {
                0
            };
            rec.nbytes = text.len() as u32;
            rec.cas = cas;
            rec.time = now;
            let location = rec.location.clone();
            match location {
                ValueLocation::Single(chunk) => self.slabs.write(chunk, 0, text.as_bytes()),
                ValueLocation::Chunked { ref body, .. } => {
                    // Numeric values are at most 20 digits; they always live
                    // in the first body chunk.
                    self.slabs.write(body[0], 0, text.as_bytes());
                }
            }
            DeltaOutcome::Applied {
                value: new_value,
                cas,
            }
        } else {
            // Grown representation: swap in a replacement item.
            let (flags_user, exptime) = (rec.flags, rec.exptime);
            drop(stripe);
            let mut staged = match self.alloc_staged(key, flags_user, exptime, text.len()) {
                Ok(staged) => staged,
                Err(_) => return DeltaOutcome::NonNumeric,
            };
            staged.write(text.as_bytes());
            match staged.commit(StoreMode::Set, 0) {
                StoreOutcome::Stored { cas } => DeltaOutcome::Applied {
                    value: new_value,
                    cas,
                },
                _ => DeltaOutcome::NotFound,
            }
        }
    }

    // ── unlink / free ──────────────────────────────────────────────────

    /// Remove an item from the hash table and its LRU chain. The chunks are
    /// freed now when unreferenced, otherwise when the last holder drops.
    pub(crate) fn unlink_locked(&self, stripe: &mut Stripe, lru: &mut LruChains, slot: u32) {
        debug_assert!(stripe.item(slot).is_linked());
        stripe.unlink(slot);
        let node = {
            let rec = stripe.item_mut(slot);
            rec.it_flags &= !flags::LINKED;
            rec.lru_node.take()
        };
        if let Some(node) = node {
            lru.remove(node);
        }
        if stripe.item(slot).refcount == 0 {
            self.free_unlinked(stripe, slot);
        }
    }

    /// Final teardown of an unlinked, unreferenced item.
    fn free_unlinked(&self, stripe: &mut Stripe, slot: u32) {
        let mut rec = stripe.free_slot(slot);
        rec.it_flags |= flags::SLABBED;
        for chunk in rec.location.chunks() {
            self.slabs.free(chunk);
        }
    }

    // ── hash expansion ─────────────────────────────────────────────────

    /// Start expansion once the load factor passes 1.5.
    pub fn maybe_start_expansion(&self) -> bool {
        if self.is_expanding() {
            return false;
        }
        let items = self.curr_items();
        let buckets = self.bucket_count() as u64;
        if items <= buckets + buckets / 2 {
            return false;
        }
        self.expanding.store(true, Ordering::Relaxed);
        for stripe in &self.stripes {
            stripe.lock().start_expansion();
        }
        debug!(items, buckets, "hash table expansion started");
        true
    }

    /// Foreground nudge: migrate one bucket of the touched stripe.
    fn nudge_migration(&self, stripe: &mut Stripe) {
        if stripe.is_expanding() {
            stripe.migrate_step(1);
        }
    }

    /// Background sweep; returns true when every stripe has finished.
    pub fn expansion_step(&self, batch: usize) -> bool {
        if !self.is_expanding() {
            return true;
        }
        let mut done = true;
        for stripe in &self.stripes {
            let mut guard = stripe.lock();
            if !guard.migrate_step(batch) {
                done = false;
            }
        }
        if done {
            self.expanding.store(false, Ordering::Relaxed);
            debug!(buckets = self.bucket_count(), "hash table expansion complete");
        }
        done
    }

    // ── LRU maintenance ────────────────────────────────────────────────

    /// One maintainer pass over every class: enforce segment caps, reclaim
    /// dead tails. Returns how many items moved or died.
    pub fn lru_maintainer_pass(&self) -> usize {
        let now = self.clock.now();
        let mut did = 0;
        for cls in 1..=self.slabs.class_count() as u8 {
            did += self.juggle_class(cls, now);
        }
        did
    }

    fn juggle_class(&self, cls: u8, now: u32) -> usize {
        let total_bytes = {
            let inner = self.slabs.lock_class(cls);
            inner.total_bytes() as u64
        };
        if total_bytes == 0 {
            return 0;
        }
        let hot_limit = total_bytes * self.settings.hot_lru_pct as u64 / 100;
        let warm_limit = total_bytes * self.settings.warm_lru_pct as u64 / 100;
        let mut moved = 0;

        // Reclaim dead tails first; expired items can sit in any segment.
        for seg in Segment::ALL {
            moved += self.reclaim_tail(cls, seg, now, 20);
        }

        let mut lru = self.lock_lru(cls);
        let cold_age = lru
            .tail(Segment::Cold)
            .map(|node| now.saturating_sub(lru.node(node).time) as u64)
            .unwrap_or(0);

        // HOT overflow: demote tails to WARM.
        for _ in 0..20 {
            let over_bytes = lru.list(Segment::Hot).bytes > hot_limit;
            let Some(node) = lru.tail(Segment::Hot) else { break };
            let age = now.saturating_sub(lru.node(node).time) as u64;
            let over_age =
                cold_age > 0 && age as f64 > cold_age as f64 * self.settings.hot_max_factor;
            if !over_bytes && !over_age {
                break;
            }
            let id = lru.node(node).item;
            let Some(mut stripe) = self.try_lock_stripe(id.stripe as usize) else {
                break;
            };
            lru.move_to_head(node, Segment::Warm, now);
            lru.moves_to_warm += 1;
            if let Some(rec) = stripe.get_item_mut(id.slot) {
                rec.it_flags &= !flags::ACTIVE;
            }
            moved += 1;
        }

        // WARM overflow: clear ACTIVE, demote to COLD.
        for _ in 0..20 {
            let over_bytes = lru.list(Segment::Warm).bytes > warm_limit;
            let Some(node) = lru.tail(Segment::Warm) else { break };
            let age = now.saturating_sub(lru.node(node).time) as u64;
            let over_age =
                cold_age > 0 && age as f64 > cold_age as f64 * self.settings.warm_max_factor;
            if !over_bytes && !over_age {
                break;
            }
            let id = lru.node(node).item;
            let Some(mut stripe) = self.try_lock_stripe(id.stripe as usize) else {
                break;
            };
            lru.move_to_head(node, Segment::Cold, now);
            lru.moves_to_cold += 1;
            if let Some(rec) = stripe.get_item_mut(id.slot) {
                rec.it_flags &= !flags::ACTIVE;
            }
            moved += 1;
        }
        moved
    }

    /// Unlink expired/flushed items from a segment tail, bounded by `limit`.
    pub(crate) fn reclaim_tail(&self, cls: u8, seg: Segment, now: u32, limit: usize) -> usize {
        let mut lru = self.lock_lru(cls);
        let mut reclaimed = 0;
        let mut cursor = lru.tail(seg);
        let mut seen = 0;
        while let Some(node) = cursor {
            if seen >= limit {
                break;
            }
            seen += 1;
            let id = lru.node(node).item;
            cursor = lru.toward_head(node);

            let Some(mut stripe) = self.try_lock_stripe(id.stripe as usize) else {
                continue;
            };
            let Some(rec) = stripe.get_item(id.slot) else {
                continue;
            };
            if rec.lru_node != Some(node) || !rec.is_linked() || rec.refcount > 0 {
                continue;
            }
            if rec.is_expired(now) || self.is_flushed(rec) {
                let fetched = rec.it_flags & flags::FETCHED != 0;
                Stats::bump(&self.stats.reclaimed);
                let class_stats = &self.slabs.class(cls).stats;
                class_stats.reclaimed.fetch_add(1, Ordering::Relaxed);
                if !fetched {
                    class_stats.expired_unfetched.fetch_add(1, Ordering::Relaxed);
                }
                self.unlink_locked(&mut stripe, &mut lru, id.slot);
                reclaimed += 1;
            }
        }
        reclaimed
    }
}

/// Strict unsigned-decimal parse: digits only (trailing spaces tolerated),
/// at most 20 digits.
fn parse_decimal(raw: &[u8]) -> Option<u64> {
    let trimmed = {
        let mut end = raw.len();
        while end > 0 && raw[end - 1] == b' ' {
            end -= 1;
        }
        &raw[..end]
    };
    if trimmed.is_empty() || trimmed.len() > INCR_MAX_DIGITS {
        return None;
    }
    let mut value: u64 = 0;
    for &b in trimmed {
        if !b.is_ascii_digit() {
            return None;
        }
        value = value.checked_mul(10)?.checked_add((b - b'0') as u64)?;
    }
    Some(value)
}

#[cfg(test)]
mod tests;
