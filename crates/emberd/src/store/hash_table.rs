//! Striped hash table: item arenas and bucket chains.
//!
//! The table is partitioned across N stripes (N a power of two). A bucket's
//! stripe is `hash mod N` and every item in a chain shares it, so one stripe
//! mutex guards both the chain and the item records it points at. Expansion
//! doubles each stripe's bucket array behind a migration cursor.

use super::item::ItemRec;

/// In-flight doubling of one stripe's bucket array.
#[derive(Debug)]
struct Expansion {
    new_buckets: Vec<Option<u32>>,
    /// Old buckets below the cursor have been migrated.
    cursor: usize,
}

/// One lock stripe: a slice of the hash table plus the records that live in
/// it. Chains are linked through `ItemRec::h_next` (slot indices local to
/// this stripe).
#[derive(Debug)]
pub struct Stripe {
    items: Vec<Option<ItemRec>>,
    free_slots: Vec<u32>,
    buckets: Vec<Option<u32>>,
    expansion: Option<Expansion>,
    /// log2 of the stripe count; low hash bits select the stripe.
    stripe_bits: u8,
    /// Linked items resident in this stripe.
    pub item_count: u64,
}

impl Stripe {
    pub fn new(local_buckets: usize, stripe_bits: u8) -> Self {
        debug_assert!(local_buckets.is_power_of_two());
        Self {
            items: Vec::new(),
            free_slots: Vec::new(),
            buckets: vec![None; local_buckets],
            expansion: None,
            stripe_bits,
            item_count: 0,
        }
    }

    #[inline]
    fn bucket_index(&self, hv: u32, len: usize) -> usize {
        ((hv >> self.stripe_bits) as usize) & (len - 1)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_expanding(&self) -> bool {
        self.expansion.is_some()
    }

    // ── item arena ─────────────────────────────────────────────────────

    pub fn alloc_slot(&mut self, rec: ItemRec) -> u32 {
        match self.free_slots.pop() {
            Some(slot) => {
                self.items[slot as usize] = Some(rec);
                slot
            }
            None => {
                self.items.push(Some(rec));
                (self.items.len() - 1) as u32
            }
        }
    }

    pub fn free_slot(&mut self, slot: u32) -> ItemRec {
        let rec = self.items[slot as usize].take().expect("live item slot");
        self.free_slots.push(slot);
        rec
    }

    pub fn item(&self, slot: u32) -> &ItemRec {
        self.items[slot as usize].as_ref().expect("live item slot")
    }

    pub fn item_mut(&mut self, slot: u32) -> &mut ItemRec {
        self.items[slot as usize].as_mut().expect("live item slot")
    }

    pub fn get_item(&self, slot: u32) -> Option<&ItemRec> {
        self.items.get(slot as usize).and_then(|s| s.as_ref())
    }

    pub fn get_item_mut(&mut self, slot: u32) -> Option<&mut ItemRec> {
        self.items.get_mut(slot as usize).and_then(|s| s.as_mut())
    }

    /// Iterate over every live record (crawler metadump, invariant checks).
    pub fn iter_items(&self) -> impl Iterator<Item = (u32, &ItemRec)> {
        self.items
            .iter()
            .enumerate()
            .filter_map(|(slot, rec)| rec.as_ref().map(|r| (slot as u32, r)))
    }

    // ── hash chains ────────────────────────────────────────────────────

    /// Find the slot holding `key`, comparing length first then bytes.
    pub fn find(&self, hv: u32, key: &[u8]) -> Option<u32> {
        let probe = |head: Option<u32>| -> Option<u32> {
            let mut cursor = head;
            while let Some(slot) = cursor {
                let rec = self.item(slot);
                if rec.key.len() == key.len() && rec.key.as_ref() == key {
                    return Some(slot);
                }
                cursor = rec.h_next;
            }
            None
        };

        match &self.expansion {
            None => probe(self.buckets[self.bucket_index(hv, self.buckets.len())]),
            Some(exp) => {
                // Inserts land in the new table, so probe it first.
                let idx = self.bucket_index(hv, exp.new_buckets.len());
                if let Some(slot) = probe(exp.new_buckets[idx]) {
                    return Some(slot);
                }
                let old = self.bucket_index(hv, self.buckets.len());
                if old >= exp.cursor {
                    probe(self.buckets[old])
                } else {
                    None
                }
            }
        }
    }

    /// Link a slot at the head of its chain. During expansion inserts always
    /// go to the new table.
    pub fn insert(&mut self, slot: u32) {
        let hv = self.item(slot).hv;
        let shift = self.stripe_bits;
        let old_head = if let Some(exp) = &mut self.expansion {
            let idx = ((hv >> shift) as usize) & (exp.new_buckets.len() - 1);
            exp.new_buckets[idx].replace(slot)
        } else {
            let len = self.buckets.len();
            let idx = ((hv >> shift) as usize) & (len - 1);
            self.buckets[idx].replace(slot)
        };
        self.item_mut(slot).h_next = old_head;
        self.item_count += 1;
    }

    /// Unlink a slot from whichever chain holds it.
    pub fn unlink(&mut self, slot: u32) {
        let hv = self.item(slot).hv;
        if self.try_unlink_from(slot, hv, false) || self.try_unlink_from(slot, hv, true) {
            self.item_count -= 1;
            self.item_mut(slot).h_next = None;
        } else {
            debug_assert!(false, "unlink of unchained slot");
        }
    }

    fn try_unlink_from(&mut self, slot: u32, hv: u32, new_table: bool) -> bool {
        let shift = self.stripe_bits;
        let head = if new_table {
            match &self.expansion {
                Some(exp) => {
                    let idx = ((hv >> shift) as usize) & (exp.new_buckets.len() - 1);
                    exp.new_buckets[idx]
                }
                None => return false,
            }
        } else {
            let idx = ((hv >> shift) as usize) & (self.buckets.len() - 1);
            self.buckets[idx]
        };

        if head == Some(slot) {
            let next = self.item(slot).h_next;
            if new_table {
                if let Some(exp) = &mut self.expansion {
                    let idx = ((hv >> shift) as usize) & (exp.new_buckets.len() - 1);
                    exp.new_buckets[idx] = next;
                }
            } else {
                let idx = ((hv >> shift) as usize) & (self.buckets.len() - 1);
                self.buckets[idx] = next;
            }
            return true;
        }

        let mut cursor = head;
        while let Some(cur) = cursor {
            let next = self.item(cur).h_next;
            if next == Some(slot) {
                let skip = self.item(slot).h_next;
                self.item_mut(cur).h_next = skip;
                return true;
            }
            cursor = next;
        }
        false
    }

    // ── expansion ──────────────────────────────────────────────────────

    /// Begin doubling this stripe's table. No-op if already expanding.
    pub fn start_expansion(&mut self) {
        if self.expansion.is_none() {
            self.expansion = Some(Expansion {
                new_buckets: vec![None; self.buckets.len() * 2],
                cursor: 0,
            });
        }
    }

    /// Migrate up to `batch` buckets. Returns true when this stripe is not
    /// expanding (anymore).
    pub fn migrate_step(&mut self, batch: usize) -> bool {
        let Some(mut exp) = self.expansion.take() else {
            return true;
        };
        let mut moved = 0;
        while exp.cursor < self.buckets.len() && moved < batch {
            let mut cursor = self.buckets[exp.cursor].take();
            while let Some(slot) = cursor {
                let (hv, next) = {
                    let rec = self.items[slot as usize].as_ref().expect("live item slot");
                    (rec.hv, rec.h_next)
                };
                let idx = ((hv >> self.stripe_bits) as usize) & (exp.new_buckets.len() - 1);
                let head = exp.new_buckets[idx];
                exp.new_buckets[idx] = Some(slot);
                self.items[slot as usize]
                    .as_mut()
                    .expect("live item slot")
                    .h_next = head;
                cursor = next;
            }
            exp.cursor += 1;
            moved += 1;
        }
        if exp.cursor >= self.buckets.len() {
            self.buckets = exp.new_buckets;
            true
        } else {
            self.expansion = Some(exp);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::item::{flags, ItemRec, ValueLocation};
    use crate::slab::ChunkRef;

    fn rec(key: &[u8], hv: u32) -> ItemRec {
        ItemRec {
            key: Box::from(key),
            hv,
            flags: 0,
            exptime: 0,
            time: 0,
            nbytes: 0,
            cas: 0,
            clsid: 1,
            it_flags: flags::LINKED,
            refcount: 0,
            h_next: None,
            lru_node: None,
            location: ValueLocation::Single(ChunkRef {
                cls: 1,
                page: 0,
                slot: 0,
            }),
        }
    }

    #[test]
    fn test_insert_find_unlink() {
        let mut stripe = Stripe::new(8, 2);
        let slot = stripe.alloc_slot(rec(b"alpha", 0x40));
        stripe.insert(slot);
        assert_eq!(stripe.find(0x40, b"alpha"), Some(slot));
        assert_eq!(stripe.find(0x40, b"beta"), None);

        stripe.unlink(slot);
        assert_eq!(stripe.find(0x40, b"alpha"), None);
        assert_eq!(stripe.item_count, 0);
    }

    #[test]
    fn test_chain_collisions() {
        let mut stripe = Stripe::new(8, 2);
        // Same bucket (identical hash), three keys chained.
        let a = stripe.alloc_slot(rec(b"a", 0x100));
        let b = stripe.alloc_slot(rec(b"bb", 0x100));
        let c = stripe.alloc_slot(rec(b"ccc", 0x100));
        for slot in [a, b, c] {
            stripe.insert(slot);
        }
        assert_eq!(stripe.find(0x100, b"a"), Some(a));
        assert_eq!(stripe.find(0x100, b"bb"), Some(b));
        assert_eq!(stripe.find(0x100, b"ccc"), Some(c));

        // Remove the middle of the chain.
        stripe.unlink(b);
        assert_eq!(stripe.find(0x100, b"bb"), None);
        assert_eq!(stripe.find(0x100, b"a"), Some(a));
        assert_eq!(stripe.find(0x100, b"ccc"), Some(c));
    }

    #[test]
    fn test_expansion_migrates_and_doubles() {
        let mut stripe = Stripe::new(4, 0);
        let mut slots = Vec::new();
        for i in 0..32u32 {
            let key = format!("key{i}");
            let slot = stripe.alloc_slot(rec(key.as_bytes(), i * 7));
            stripe.insert(slot);
            slots.push((i * 7, key));
        }

        stripe.start_expansion();
        assert!(stripe.is_expanding());

        // Everything stays findable mid-migration.
        while !stripe.migrate_step(1) {
            for (hv, key) in &slots {
                assert!(stripe.find(*hv, key.as_bytes()).is_some(), "lost {key}");
            }
        }
        assert!(!stripe.is_expanding());
        assert_eq!(stripe.bucket_count(), 8);
        for (hv, key) in &slots {
            assert!(stripe.find(*hv, key.as_bytes()).is_some());
        }
    }

    #[test]
    fn test_insert_during_expansion_lands_in_new_table() {
        let mut stripe = Stripe::new(4, 0);
        stripe.start_expansion();
        let slot = stripe.alloc_slot(rec(b"fresh", 0x9));
        stripe.insert(slot);
        assert_eq!(stripe.find(0x9, b"fresh"), Some(slot));
        while !stripe.migrate_step(16) {}
        assert_eq!(stripe.find(0x9, b"fresh"), Some(slot));
    }
}
