//! Slab allocator: size-classed page/chunk memory bounded by `maxbytes`.
//!
//! The budget is split into fixed pages. Each page belongs to exactly one
//! class and is carved into that class's chunk size. Freed chunks go back on
//! the owning class's freelist; pages move between classes only through the
//! rebalancer.

pub mod page;
pub mod rebalance;

use crate::config::Settings;
use crate::store::item::{ItemId, CHUNK_HEADER_SIZE};
use page::Page;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use tracing::debug;

/// Smallest valid class id; 0 is a sentinel.
pub const POWER_SMALLEST: usize = 1;

/// Upper bound on the number of size classes.
pub const MAX_CLASSES: usize = 64;

/// Reference to one chunk: class, page within class, slot within page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkRef {
    pub cls: u8,
    pub page: u32,
    pub slot: u32,
}

/// Chunk size ladder: `chunk_size * factor^i`, 8-byte aligned, capped at
/// `slab_chunk_size_max` which always terminates the table.
#[derive(Debug)]
pub struct SizeClasses {
    /// Index 0 is a sentinel (size 0).
    sizes: Vec<usize>,
}

impl SizeClasses {
    pub fn build(settings: &Settings) -> Self {
        let align = |n: usize| (n + 7) & !7;
        let mut sizes = vec![0usize];
        let mut size = align(settings.chunk_size);
        let max = settings.slab_chunk_size_max;

        while (size as f64) <= max as f64 / settings.factor && sizes.len() < MAX_CLASSES - 1 {
            sizes.push(size);
            size = align((size as f64 * settings.factor) as usize);
        }
        sizes.push(align(max));
        Self { sizes }
    }

    /// Number of usable classes (ids `1..=count`).
    pub fn count(&self) -> usize {
        self.sizes.len() - 1
    }

    pub fn size_of(&self, cls: u8) -> usize {
        self.sizes[cls as usize]
    }

    /// Largest class; holds the body chunks of chained values.
    pub fn largest(&self) -> u8 {
        (self.sizes.len() - 1) as u8
    }

    /// Smallest class whose chunk fits `ntotal`; `None` when the value must
    /// be chained.
    pub fn class_for(&self, ntotal: usize) -> Option<u8> {
        self.sizes[POWER_SMALLEST..]
            .iter()
            .position(|&size| size >= ntotal)
            .map(|idx| (idx + POWER_SMALLEST) as u8)
    }
}

/// Per-class counters read without locks by `stats` and the automover.
#[derive(Debug, Default)]
pub struct ClassStats {
    pub evicted: AtomicU64,
    /// Age (seconds since last access) of the most recent eviction victim.
    pub evicted_time: AtomicU32,
    pub evicted_unfetched: AtomicU64,
    pub expired_unfetched: AtomicU64,
    pub reclaimed: AtomicU64,
    pub outofmemory: AtomicU64,
    pub tailrepairs: AtomicU64,
    pub crawler_reclaimed: AtomicU64,
    /// Tail walks skipped because the victim was reference-locked.
    pub lrutail_reflocked: AtomicU64,
    pub get_hits: AtomicU64,
    pub cmd_set: AtomicU64,
}

/// Mutable per-class state: pages, freelist, rebalance restriction.
///
/// Page slots are never renumbered: a page leaving the class leaves a
/// tombstone so `ChunkRef` page indices stored in item records stay valid.
#[derive(Debug)]
pub struct ClassInner {
    chunk_size: usize,
    perslab: usize,
    pages: Vec<Option<Page>>,
    free: Vec<ChunkRef>,
    /// Page excluded from allocation while the rebalancer drains it.
    restricted_page: Option<u32>,
    used_chunks: u64,
}

impl ClassInner {
    fn new(chunk_size: usize, page_size: usize) -> Self {
        Self {
            chunk_size,
            perslab: page_size / chunk_size,
            pages: Vec::new(),
            free: Vec::new(),
            restricted_page: None,
            used_chunks: 0,
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn perslab(&self) -> usize {
        self.perslab
    }

    pub fn page_count(&self) -> usize {
        self.pages.iter().filter(|p| p.is_some()).count()
    }

    pub fn free_chunks(&self) -> usize {
        self.free.len()
    }

    pub fn used_chunks(&self) -> u64 {
        self.used_chunks
    }

    pub fn total_chunks(&self) -> usize {
        self.page_count() * self.perslab
    }

    /// Bytes of item data this class can hold; the LRU caps derive from it.
    pub fn total_bytes(&self) -> usize {
        self.total_chunks() * self.chunk_size
    }

    fn add_page(&mut self, cls: u8, block: Box<[u8]>) {
        let page = Page::carve(block, self.perslab);
        let page_idx = match self.pages.iter().position(|p| p.is_none()) {
            Some(idx) => {
                self.pages[idx] = Some(page);
                idx as u32
            }
            None => {
                self.pages.push(Some(page));
                (self.pages.len() - 1) as u32
            }
        };
        for slot in (0..self.perslab as u32).rev() {
            self.free.push(ChunkRef {
                cls,
                page: page_idx,
                slot,
            });
        }
    }

    fn alloc_chunk(&mut self) -> Option<ChunkRef> {
        let chunk = self.free.pop()?;
        self.used_chunks += 1;
        Some(chunk)
    }

    fn free_chunk(&mut self, chunk: ChunkRef) {
        self.page_mut(chunk.page).set_owner(chunk.slot, None);
        self.used_chunks -= 1;
        // Chunks on a draining page stay off the freelist; the page is
        // leaving this class.
        if self.restricted_page != Some(chunk.page) {
            self.free.push(chunk);
        }
    }

    pub fn page(&self, idx: u32) -> &Page {
        self.pages[idx as usize].as_ref().expect("live page")
    }

    pub(crate) fn page_mut(&mut self, idx: u32) -> &mut Page {
        self.pages[idx as usize].as_mut().expect("live page")
    }

    /// Index of a page the rebalancer may drain, if any.
    pub(crate) fn pick_victim_page(&self) -> Option<u32> {
        self.pages
            .iter()
            .position(|p| p.is_some())
            .map(|idx| idx as u32)
    }

    pub(crate) fn restricted_page(&self) -> Option<u32> {
        self.restricted_page
    }

    /// Bar a page from allocation and drop its freelist entries.
    pub(crate) fn restrict_page(&mut self, idx: u32) {
        self.restricted_page = Some(idx);
        self.free.retain(|c| c.page != idx);
    }

    /// Detach the fully-drained restricted page, leaving a tombstone so the
    /// remaining page indices stay stable.
    pub(crate) fn detach_restricted(&mut self) -> Option<Box<[u8]>> {
        let idx = self.restricted_page.take()?;
        let page = self.pages[idx as usize].take()?;
        Some(page.into_block())
    }
}

/// One slab class: locked inner state plus lock-free counters.
#[derive(Debug)]
pub struct SlabClass {
    pub id: u8,
    pub chunk_size: usize,
    pub inner: Mutex<ClassInner>,
    pub stats: ClassStats,
}

/// Global page budget.
#[derive(Debug)]
struct PagePool {
    total_pages: usize,
    used_pages: usize,
}

/// The allocator: class table plus the shared page budget.
#[derive(Debug)]
pub struct SlabAllocator {
    classes: Vec<SlabClass>,
    pool: Mutex<PagePool>,
    sizes: SizeClasses,
    page_size: usize,
}

impl SlabAllocator {
    pub fn new(settings: &Settings) -> Self {
        let sizes = SizeClasses::build(settings);
        let mut classes = Vec::with_capacity(sizes.count() + 1);
        // Sentinel so class ids index directly.
        classes.push(SlabClass {
            id: 0,
            chunk_size: 0,
            inner: Mutex::new(ClassInner::new(settings.slab_page_size, settings.slab_page_size)),
            stats: ClassStats::default(),
        });
        for id in POWER_SMALLEST..=sizes.count() {
            let chunk_size = sizes.size_of(id as u8);
            classes.push(SlabClass {
                id: id as u8,
                chunk_size,
                inner: Mutex::new(ClassInner::new(chunk_size, settings.slab_page_size)),
                stats: ClassStats::default(),
            });
        }
        Self {
            classes,
            pool: Mutex::new(PagePool {
                total_pages: settings.maxbytes / settings.slab_page_size,
                used_pages: 0,
            }),
            sizes,
            page_size: settings.slab_page_size,
        }
    }

    pub fn sizes(&self) -> &SizeClasses {
        &self.sizes
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    pub fn class_count(&self) -> usize {
        self.sizes.count()
    }

    pub fn class(&self, id: u8) -> &SlabClass {
        &self.classes[id as usize]
    }

    /// Usable value bytes per body chunk of a chained item.
    pub fn body_capacity(&self) -> usize {
        self.sizes.size_of(self.sizes.largest()) - CHUNK_HEADER_SIZE
    }

    pub fn pages_allocated(&self) -> usize {
        self.pool.lock().used_pages
    }

    pub fn pages_total(&self) -> usize {
        self.pool.lock().total_pages
    }

    /// Allocate one chunk. `None` means the freelist is empty and the page
    /// budget is exhausted; the caller decides whether to evict and retry.
    pub fn alloc(&self, cls: u8) -> Option<ChunkRef> {
        let class = self.class(cls);
        let mut inner = class.inner.lock();
        if let Some(chunk) = inner.alloc_chunk() {
            return Some(chunk);
        }
        // Freelist dry: try to grow the class with a fresh page.
        {
            let mut pool = self.pool.lock();
            if pool.used_pages >= pool.total_pages {
                return None;
            }
            pool.used_pages += 1;
        }
        debug!(class = cls, pages = inner.page_count() + 1, "assigned new slab page");
        inner.add_page(cls, vec![0u8; self.page_size].into_boxed_slice());
        inner.alloc_chunk()
    }

    /// Return a chunk to its class freelist and clear its owner.
    pub fn free(&self, chunk: ChunkRef) {
        let mut inner = self.class(chunk.cls).inner.lock();
        inner.free_chunk(chunk);
    }

    pub fn set_owner(&self, chunk: ChunkRef, owner: Option<ItemId>) {
        let mut inner = self.class(chunk.cls).inner.lock();
        inner.page_mut(chunk.page).set_owner(chunk.slot, owner);
    }

    pub fn owner(&self, chunk: ChunkRef) -> Option<ItemId> {
        let inner = self.class(chunk.cls).inner.lock();
        inner.page(chunk.page).owner(chunk.slot)
    }

    /// Copy `bytes` into a chunk at `offset`.
    pub fn write(&self, chunk: ChunkRef, offset: usize, bytes: &[u8]) {
        let mut inner = self.class(chunk.cls).inner.lock();
        let chunk_size = inner.chunk_size();
        let data = inner.page_mut(chunk.page).slot_data_mut(chunk.slot, chunk_size);
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
    }

    /// Append `len` bytes starting at `offset` onto `out`.
    pub fn read_into(&self, chunk: ChunkRef, offset: usize, len: usize, out: &mut Vec<u8>) {
        let inner = self.class(chunk.cls).inner.lock();
        let chunk_size = inner.chunk_size();
        let data = inner.page(chunk.page).slot_data(chunk.slot, chunk_size);
        out.extend_from_slice(&data[offset..offset + len]);
    }

    /// Copy a whole chunk's slot from `src` to `dst` (rescue path). Both
    /// chunks must belong to the same class.
    pub fn copy_chunk(&self, src: ChunkRef, dst: ChunkRef) {
        debug_assert_eq!(src.cls, dst.cls);
        let mut inner = self.class(src.cls).inner.lock();
        let chunk_size = inner.chunk_size();
        let from = inner.page(src.page).slot_data(src.slot, chunk_size).to_vec();
        inner
            .page_mut(dst.page)
            .slot_data_mut(dst.slot, chunk_size)
            .copy_from_slice(&from);
    }

    pub fn lock_class(&self, cls: u8) -> MutexGuard<'_, ClassInner> {
        self.class(cls).inner.lock()
    }

    /// Move a fully drained, restricted page from `src` to `dst`, re-carving
    /// it with the destination chunk size.
    pub(crate) fn transfer_page(&self, src: u8, dst: u8, block: Box<[u8]>) {
        let mut inner = self.class(dst).inner.lock();
        inner.add_page(dst, block);
        debug!(from = src, to = dst, "slab page reassigned");
    }

    /// Record an eviction for the automover window and `stats items`.
    pub fn note_eviction(&self, cls: u8, age: u32, fetched: bool) {
        let stats = &self.class(cls).stats;
        stats.evicted.fetch_add(1, Ordering::Relaxed);
        stats.evicted_time.store(age, Ordering::Relaxed);
        if !fetched {
            stats.evicted_unfetched.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_settings() -> Settings {
        Settings {
            maxbytes: 4 * 1024 * 1024,
            slab_page_size: 1024 * 1024,
            slab_chunk_size_max: 512 * 1024,
            ..Settings::default()
        }
    }

    #[test]
    fn test_class_table_shape() {
        let sizes = SizeClasses::build(&test_settings());
        assert!(sizes.count() > 10);
        // First class is the configured minimum, aligned.
        assert_eq!(sizes.size_of(1), 48);
        // Table terminates at the chunk ceiling.
        assert_eq!(sizes.size_of(sizes.largest()), 512 * 1024);
    }

    #[test]
    fn test_class_for_picks_smallest_fit() {
        let sizes = SizeClasses::build(&test_settings());
        let cls = sizes.class_for(100).unwrap();
        assert!(sizes.size_of(cls) >= 100);
        assert!(sizes.size_of(cls - 1) < 100);
        // Values beyond the ceiling have no single-chunk class.
        assert_eq!(sizes.class_for(512 * 1024 + 1), None);
    }

    #[test]
    fn test_alloc_until_budget_exhausted() {
        let settings = Settings {
            maxbytes: 2 * 1024 * 1024,
            ..test_settings()
        };
        let allocator = SlabAllocator::new(&settings);
        let cls = allocator.sizes().largest();
        // 2 pages of 2 chunks each at the 512K class.
        let mut got = Vec::new();
        while let Some(chunk) = allocator.alloc(cls) {
            got.push(chunk);
        }
        assert_eq!(got.len(), 4);
        assert_eq!(allocator.pages_allocated(), 2);

        // Freeing one makes the next alloc succeed again.
        allocator.free(got.pop().unwrap());
        assert!(allocator.alloc(cls).is_some());
    }

    #[test]
    fn test_chunk_data_roundtrip() {
        let allocator = SlabAllocator::new(&test_settings());
        let cls = allocator.sizes().class_for(200).unwrap();
        let chunk = allocator.alloc(cls).unwrap();
        allocator.write(chunk, 0, b"hello slab");
        let mut out = Vec::new();
        allocator.read_into(chunk, 0, 10, &mut out);
        assert_eq!(&out, b"hello slab");
    }

    proptest! {
        #[test]
        fn prop_sizes_monotonic_and_aligned(factor in 1.05f64..2.0) {
            let settings = Settings { factor, ..test_settings() };
            let sizes = SizeClasses::build(&settings);
            for cls in 2..=sizes.largest() {
                prop_assert!(sizes.size_of(cls) > sizes.size_of(cls - 1));
            }
            for cls in 1..=sizes.largest() {
                prop_assert_eq!(sizes.size_of(cls) % 8, 0);
            }
        }

        #[test]
        fn prop_class_for_roundtrip(ntotal in 1usize..=512 * 1024) {
            let sizes = SizeClasses::build(&test_settings());
            let cls = sizes.class_for(ntotal).unwrap();
            prop_assert!(sizes.size_of(cls) >= ntotal);
            if cls > 1 {
                prop_assert!(sizes.size_of(cls - 1) < ntotal);
            }
        }
    }
}
