//! Item records: metadata for every cached object.
//!
//! Metadata and key live in a per-stripe slot arena; value bytes live in the
//! slab chunk(s) referenced by [`ValueLocation`]. Hash chains and LRU links
//! are index handles, never pointers.

use crate::slab::ChunkRef;

/// Hard protocol limit on key length.
pub const KEY_MAX_LENGTH: usize = 250;

/// Accounting size of per-item metadata, used for slab class selection so
/// class behavior matches the classic contiguous layout.
pub const ITEM_HEADER_SIZE: usize = 48;

/// Accounting size of a body-chunk header.
pub const CHUNK_HEADER_SIZE: usize = 48;

/// Extra accounting bytes when CAS is enabled.
pub const CAS_SIZE: usize = 8;

/// Item status bit-flags.
pub mod flags {
    /// Reachable via the hash table and present on an LRU chain.
    pub const LINKED: u8 = 1;
    /// Item carries a CAS identifier.
    pub const CAS: u8 = 2;
    /// Chunk has been returned to a slab freelist.
    pub const SLABBED: u8 = 4;
    /// Fetched at least once in its lifetime.
    pub const FETCHED: u8 = 8;
    /// Fetched again while FETCHED; cleared on LRU shuffling.
    pub const ACTIVE: u8 = 16;
    /// Value spans a chain of body chunks.
    pub const CHUNKED: u8 = 32;
}

/// Stable handle to an item: stripe index plus arena slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ItemId {
    pub stripe: u32,
    pub slot: u32,
}

/// Where an item's value bytes live.
#[derive(Debug, Clone)]
pub enum ValueLocation {
    /// Entire value in one chunk.
    Single(ChunkRef),
    /// Head chunk for the record itself plus ordered body chunks.
    Chunked { head: ChunkRef, body: Vec<ChunkRef> },
}

impl ValueLocation {
    /// Every chunk backing this item, head first.
    pub fn chunks(&self) -> impl Iterator<Item = ChunkRef> + '_ {
        let (head, body) = match self {
            ValueLocation::Single(chunk) => (*chunk, &[][..]),
            ValueLocation::Chunked { head, body } => (*head, body.as_slice()),
        };
        std::iter::once(head).chain(body.iter().copied())
    }
}

/// One cached item. Fields other than the LRU node index are guarded by the
/// owning stripe lock; `lru_node` is written under the stripe lock but the
/// node it names is relinked under the class LRU lock.
#[derive(Debug)]
pub struct ItemRec {
    pub key: Box<[u8]>,
    pub hv: u32,
    /// Client-opaque flags stored alongside the value.
    pub flags: u32,
    /// Relative expiry; 0 = never.
    pub exptime: u32,
    /// Last access time (relative seconds).
    pub time: u32,
    /// Value length in bytes.
    pub nbytes: u32,
    pub cas: u64,
    /// Slab class chosen from the total accounting size.
    pub clsid: u8,
    pub it_flags: u8,
    /// Live references: one per holder (hash table linkage not counted).
    pub refcount: u16,
    /// Next slot in this stripe's hash chain.
    pub h_next: Option<u32>,
    /// Node index in the owning class's LRU arena.
    pub lru_node: Option<u32>,
    pub location: ValueLocation,
}

impl ItemRec {
    #[inline]
    pub fn is_linked(&self) -> bool {
        self.it_flags & flags::LINKED != 0
    }

    #[inline]
    pub fn is_chunked(&self) -> bool {
        self.it_flags & flags::CHUNKED != 0
    }

    /// Expired strictly by its own exptime (flush watermarks are separate).
    #[inline]
    pub fn is_expired(&self, now: u32) -> bool {
        self.exptime != 0 && self.exptime <= now
    }
}

/// Accounting size used for slab class selection: metadata header, optional
/// CAS, key, value, trailing CRLF.
#[inline]
pub fn item_total_size(nkey: usize, nbytes: usize, use_cas: bool) -> usize {
    ITEM_HEADER_SIZE + if use_cas { CAS_SIZE } else { 0 } + nkey + nbytes + 2
}

/// Snapshot of item metadata handed to the protocol layer along with a
/// pinned reference.
#[derive(Debug, Clone, Copy)]
pub struct ItemMeta {
    pub id: ItemId,
    pub flags: u32,
    pub nbytes: u32,
    pub cas: u64,
    pub clsid: u8,
    pub exptime: u32,
    pub time: u32,
    pub fetched: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_size_accounts_for_cas() {
        let without = item_total_size(3, 10, false);
        let with = item_total_size(3, 10, true);
        assert_eq!(with - without, CAS_SIZE);
        assert_eq!(without, ITEM_HEADER_SIZE + 3 + 10 + 2);
    }

    #[test]
    fn test_expiry_check() {
        let rec = ItemRec {
            key: Box::from(&b"k"[..]),
            hv: 0,
            flags: 0,
            exptime: 100,
            time: 1,
            nbytes: 0,
            cas: 0,
            clsid: 1,
            it_flags: flags::LINKED,
            refcount: 0,
            h_next: None,
            lru_node: None,
            location: ValueLocation::Single(crate::slab::ChunkRef {
                cls: 1,
                page: 0,
                slot: 0,
            }),
        };
        assert!(!rec.is_expired(99));
        assert!(rec.is_expired(100));
        // exptime 0 never expires
        let eternal = ItemRec { exptime: 0, ..rec };
        assert!(!eternal.is_expired(u32::MAX));
    }
}
