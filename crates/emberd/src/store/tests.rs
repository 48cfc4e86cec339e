//! Engine-level tests: lifecycle, eviction, expiry, flush, rebalance.

use super::lru::Segment;
use super::*;
use crate::clock::Clock;
use crate::config::Settings;

fn small_settings() -> Settings {
    Settings {
        tcp_addr: String::new(),
        maxbytes: 4 * 1024 * 1024,
        slab_page_size: 64 * 1024,
        slab_chunk_size_max: 32 * 1024,
        hashpower_init: 12,
        lru_maintainer_thread: true,
        ..Settings::default()
    }
}

fn engine_with(settings: Settings) -> Arc<CacheEngine> {
    settings.validate().expect("test settings");
    let clock = Clock::new();
    clock.set(10);
    CacheEngine::new(Arc::new(settings), clock)
}

fn engine() -> Arc<CacheEngine> {
    engine_with(small_settings())
}

fn set(engine: &Arc<CacheEngine>, key: &[u8], value: &[u8]) -> StoreOutcome {
    store(engine, StoreMode::Set, key, value, 0, 0)
}

fn store(
    engine: &Arc<CacheEngine>,
    mode: StoreMode,
    key: &[u8],
    value: &[u8],
    exptime: u32,
    req_cas: u64,
) -> StoreOutcome {
    let mut staged = engine
        .alloc_staged(key, 0, exptime, value.len())
        .expect("alloc");
    staged.write(value);
    staged.commit(mode, req_cas)
}

fn get_value(engine: &Arc<CacheEngine>, key: &[u8]) -> Option<Vec<u8>> {
    engine.get(key, true).map(|item| item.read_value())
}

/// Structural invariants that must hold after any command sequence.
fn check_invariants(engine: &Arc<CacheEngine>) {
    // Page budget is respected.
    assert!(engine.slabs().pages_allocated() <= engine.slabs().pages_total());

    // Every linked item sits on exactly one LRU node that points back at it.
    let mut linked = 0u64;
    for idx in 0..engine.stripe_count() {
        let stripe = engine.lock_stripe(idx);
        for (slot, rec) in stripe.iter_items() {
            if rec.is_linked() {
                linked += 1;
                let node = rec.lru_node.expect("linked item has LRU node");
                let lru = engine.lock_lru(rec.clsid);
                assert_eq!(
                    lru.node(node).item,
                    super::item::ItemId {
                        stripe: idx as u32,
                        slot
                    }
                );
            } else {
                assert!(rec.refcount > 0, "unlinked item must be pinned");
            }
        }
    }
    // LRU population matches the hash table population.
    let mut on_lru = 0u64;
    for cls in 1..=engine.slabs().class_count() as u8 {
        on_lru += engine.lock_lru(cls).total_count();
    }
    assert_eq!(linked, on_lru);
    assert_eq!(linked, engine.curr_items());
}

#[test]
fn test_set_then_get_roundtrip() {
    let engine = engine();
    assert!(matches!(
        set(&engine, b"foo", b"bar"),
        StoreOutcome::Stored { .. }
    ));
    let item = engine.get(b"foo", true).expect("hit");
    assert_eq!(item.meta.nbytes, 3);
    assert_eq!(item.read_value(), b"bar");
    drop(item);
    check_invariants(&engine);
}

#[test]
fn test_get_miss() {
    let engine = engine();
    assert!(engine.get(b"absent", true).is_none());
}

#[test]
fn test_flags_and_cas_preserved() {
    let engine = engine();
    let mut staged = engine.alloc_staged(b"k", 0xdead, 0, 2).unwrap();
    staged.write(b"hi");
    let StoreOutcome::Stored { cas } = staged.commit(StoreMode::Set, 0) else {
        panic!("store failed");
    };
    let item = engine.get(b"k", true).unwrap();
    assert_eq!(item.meta.flags, 0xdead);
    assert_eq!(item.meta.cas, cas);
    assert!(cas > 0);
}

#[test]
fn test_add_and_replace_semantics() {
    let engine = engine();
    assert!(matches!(
        store(&engine, StoreMode::Add, b"foo", b"bar", 0, 0),
        StoreOutcome::Stored { .. }
    ));
    // Scenario: add over an existing key refuses and keeps the old value.
    assert_eq!(
        store(&engine, StoreMode::Add, b"foo", b"baz", 0, 0),
        StoreOutcome::NotStored
    );
    assert_eq!(get_value(&engine, b"foo").unwrap(), b"bar");

    assert_eq!(
        store(&engine, StoreMode::Replace, b"nope", b"x", 0, 0),
        StoreOutcome::NotStored
    );
    assert!(matches!(
        store(&engine, StoreMode::Replace, b"foo", b"qux", 0, 0),
        StoreOutcome::Stored { .. }
    ));
    assert_eq!(get_value(&engine, b"foo").unwrap(), b"qux");
}

#[test]
fn test_cas_ladder() {
    let engine = engine();
    assert!(engine.get(b"k", true).is_none());
    set(&engine, b"k", b"A");
    let cas1 = engine.get(b"k", true).unwrap().meta.cas;

    // Matching CAS stores; the stale CAS then conflicts.
    assert!(matches!(
        store(&engine, StoreMode::Cas, b"k", b"B", 0, cas1),
        StoreOutcome::Stored { .. }
    ));
    assert_eq!(
        store(&engine, StoreMode::Cas, b"k", b"C", 0, cas1),
        StoreOutcome::Exists
    );
    assert_eq!(get_value(&engine, b"k").unwrap(), b"B");
    assert_eq!(
        store(&engine, StoreMode::Cas, b"missing", b"D", 0, cas1),
        StoreOutcome::NotFound
    );
}

#[test]
fn test_cas_strictly_increases() {
    let engine = engine();
    let mut last = 0;
    for i in 0..20 {
        let key = format!("key{i}");
        let StoreOutcome::Stored { cas } = set(&engine, key.as_bytes(), b"v") else {
            panic!("store failed");
        };
        assert!(cas > last, "cas {cas} not above {last}");
        last = cas;
    }
}

#[test]
fn test_delete() {
    let engine = engine();
    set(&engine, b"k", b"v");
    assert!(engine.delete(b"k"));
    assert!(engine.get(b"k", true).is_none());
    assert!(!engine.delete(b"k"));
    check_invariants(&engine);
}

#[test]
fn test_expiry_is_lazy() {
    let engine = engine();
    let now = engine.clock().now();
    store(&engine, StoreMode::Set, b"soon", b"v", now + 5, 0);
    assert!(engine.get(b"soon", true).is_some());

    engine.clock().set(now + 6);
    assert!(engine.get(b"soon", true).is_none());
    // The lazy unlink actually removed it.
    assert_eq!(engine.curr_items(), 0);
    check_invariants(&engine);
}

#[test]
fn test_flush_all_immediate() {
    let engine = engine();
    set(&engine, b"a", b"1");
    set(&engine, b"b", b"2");
    engine.flush_all(0);
    assert!(engine.get(b"a", true).is_none());
    assert!(engine.get(b"b", true).is_none());

    // New stores after the flush are visible.
    set(&engine, b"c", b"3");
    assert_eq!(get_value(&engine, b"c").unwrap(), b"3");
    check_invariants(&engine);
}

#[test]
fn test_flush_all_delayed() {
    let engine = engine();
    let now = engine.clock().now();
    set(&engine, b"k", b"v");
    engine.flush_all(now + 10);
    assert!(engine.get(b"k", true).is_some());

    engine.clock().set(now + 10);
    assert!(engine.get(b"k", true).is_none());
}

#[test]
fn test_incr_decr() {
    let engine = engine();
    set(&engine, b"n", b"10");
    assert_eq!(
        engine.add_delta(b"n", true, 5),
        DeltaOutcome::Applied {
            value: 15,
            cas: engine.current_cas()
        }
    );
    assert_eq!(get_value(&engine, b"n").unwrap(), b"15");

    // Decrement saturates at zero.
    let DeltaOutcome::Applied { value, .. } = engine.add_delta(b"n", false, 100) else {
        panic!("delta failed");
    };
    assert_eq!(value, 0);

    // Increment wraps at 2^64.
    set(&engine, b"big", u64::MAX.to_string().as_bytes());
    let DeltaOutcome::Applied { value, .. } = engine.add_delta(b"big", true, 1) else {
        panic!("delta failed");
    };
    assert_eq!(value, 0);

    assert_eq!(engine.add_delta(b"missing", true, 1), DeltaOutcome::NotFound);
    set(&engine, b"txt", b"abc");
    assert_eq!(engine.add_delta(b"txt", true, 1), DeltaOutcome::NonNumeric);
}

#[test]
fn test_incr_grows_representation() {
    let engine = engine();
    set(&engine, b"n", b"9");
    let DeltaOutcome::Applied { value, .. } = engine.add_delta(b"n", true, 993) else {
        panic!("delta failed");
    };
    assert_eq!(value, 1002);
    assert_eq!(get_value(&engine, b"n").unwrap(), b"1002");
    check_invariants(&engine);
}

#[test]
fn test_append_prepend() {
    let engine = engine();
    assert_eq!(
        store(&engine, StoreMode::Append, b"k", b"x", 0, 0),
        StoreOutcome::NotStored
    );
    set(&engine, b"k", b"mid");
    assert!(matches!(
        store(&engine, StoreMode::Append, b"k", b"post", 0, 0),
        StoreOutcome::Stored { .. }
    ));
    assert!(matches!(
        store(&engine, StoreMode::Prepend, b"k", b"pre", 0, 0),
        StoreOutcome::Stored { .. }
    ));
    assert_eq!(get_value(&engine, b"k").unwrap(), b"premidpost");
    check_invariants(&engine);
}

#[test]
fn test_key_and_value_limits() {
    let engine = engine_with(Settings {
        item_size_max: 2048,
        ..small_settings()
    });
    let key250 = vec![b'k'; 250];
    let key251 = vec![b'k'; 251];
    assert!(engine.alloc_staged(&key250, 0, 0, 1).is_ok());
    assert!(matches!(
        engine.alloc_staged(&key251, 0, 0, 1),
        Err(StoreError::TooLarge)
    ));
    assert!(engine.alloc_staged(b"k", 0, 0, 2048).is_ok());
    assert!(matches!(
        engine.alloc_staged(b"k", 0, 0, 2049),
        Err(StoreError::TooLarge)
    ));
}

#[test]
fn test_chunked_value_roundtrip() {
    let engine = engine();
    // Larger than slab_chunk_size_max (32K): spans multiple body chunks.
    let value: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    assert!(matches!(
        set(&engine, b"big", &value),
        StoreOutcome::Stored { .. }
    ));
    let item = engine.get(b"big", true).expect("hit");
    assert!(item.meta.nbytes as usize == value.len());
    assert_eq!(item.read_value(), value);
    drop(item);
    check_invariants(&engine);

    // Replacing it frees the whole chain.
    set(&engine, b"big", b"tiny");
    assert_eq!(get_value(&engine, b"big").unwrap(), b"tiny");
    check_invariants(&engine);
}

#[test]
fn test_eviction_under_pressure() {
    // Two pages only: filling far past the budget must evict, not fail.
    let engine = engine_with(Settings {
        maxbytes: 2 * 64 * 1024,
        ..small_settings()
    });
    let value = vec![b'v'; 1000];
    for i in 0..200 {
        let key = format!("key{i:03}");
        let outcome = store(&engine, StoreMode::Set, key.as_bytes(), &value, 0, 0);
        assert!(
            matches!(outcome, StoreOutcome::Stored { .. }),
            "set {i} failed: {outcome:?}"
        );
    }
    // Early keys were evicted, late keys survive.
    assert!(engine.get(b"key000", true).is_none());
    assert!(engine.get(b"key199", true).is_some());
    assert!(Stats::get(&engine.stats.evictions) > 0);
    check_invariants(&engine);
}

#[test]
fn test_eviction_skips_pinned_items() {
    let engine = engine_with(Settings {
        maxbytes: 2 * 64 * 1024,
        ..small_settings()
    });
    let value = vec![b'v'; 1000];
    set(&engine, b"pinned", &value);
    let held = engine.get(b"pinned", true).expect("pin");

    for i in 0..200 {
        let key = format!("key{i:03}");
        store(&engine, StoreMode::Set, key.as_bytes(), &value, 0, 0);
    }
    // The pinned item survived the stampede.
    assert_eq!(held.read_value(), value);
    drop(held);
    check_invariants(&engine);
}

#[test]
fn test_unlink_while_referenced_frees_on_release() {
    let engine = engine();
    set(&engine, b"k", b"v");
    let held = engine.get(b"k", true).expect("pin");
    assert!(engine.delete(b"k"));
    // Gone from the index, but the holder still reads its value.
    assert!(engine.get(b"k", true).is_none());
    assert_eq!(held.read_value(), b"v");
    drop(held);
    // Chunk is back on the freelist; storing reuses it without growth.
    let pages = engine.slabs().pages_allocated();
    set(&engine, b"k2", b"v");
    assert_eq!(engine.slabs().pages_allocated(), pages);
    check_invariants(&engine);
}

#[test]
fn test_segmented_lru_promotion() {
    let engine = engine();
    set(&engine, b"k", b"v");
    let clsid = engine.get(b"k", false).unwrap().meta.clsid;
    assert_eq!(engine.lock_lru(clsid).list(Segment::Hot).count, 1);

    // First fetch marks FETCHED; second promotes HOT -> WARM.
    engine.get(b"k", true);
    assert_eq!(engine.lock_lru(clsid).list(Segment::Hot).count, 1);
    engine.get(b"k", true);
    assert_eq!(engine.lock_lru(clsid).list(Segment::Warm).count, 1);
    assert_eq!(engine.lock_lru(clsid).list(Segment::Hot).count, 0);
}

#[test]
fn test_temp_lru_admission() {
    let engine = engine_with(Settings {
        temp_lru: true,
        ..small_settings()
    });
    let now = engine.clock().now();
    store(&engine, StoreMode::Set, b"short", b"v", now + 30, 0);
    store(&engine, StoreMode::Set, b"long", b"v", now + 3600, 0);
    let clsid = engine.get(b"short", false).unwrap().meta.clsid;
    let lru = engine.lock_lru(clsid);
    assert_eq!(lru.list(Segment::Temp).count, 1);
    assert_eq!(lru.list(Segment::Hot).count, 1);
    drop(lru);

    // TEMP items never promote.
    engine.get(b"short", true);
    engine.get(b"short", true);
    assert_eq!(engine.lock_lru(clsid).list(Segment::Temp).count, 1);
}

#[test]
fn test_maintainer_reclaims_expired_tail() {
    let engine = engine();
    let now = engine.clock().now();
    for i in 0..10 {
        let key = format!("k{i}");
        store(&engine, StoreMode::Set, key.as_bytes(), b"v", now + 1, 0);
    }
    engine.clock().set(now + 5);
    let reclaimed = engine.lru_maintainer_pass();
    assert!(reclaimed > 0);
    assert_eq!(engine.curr_items(), 0);
    check_invariants(&engine);
}

#[test]
fn test_hash_expansion_keeps_items() {
    let engine = engine_with(Settings {
        maxbytes: 16 * 1024 * 1024,
        slab_page_size: 1024 * 1024,
        slab_chunk_size_max: 512 * 1024,
        hashpower_init: 12,
        ..small_settings()
    });
    let count = 8000u32;
    for i in 0..count {
        let key = format!("expand{i}");
        assert!(matches!(
            set(&engine, key.as_bytes(), b"v"),
            StoreOutcome::Stored { .. }
        ));
    }
    assert!(engine.maybe_start_expansion());
    let buckets_before = engine.bucket_count();
    while !engine.expansion_step(1024) {}
    assert_eq!(engine.bucket_count(), buckets_before * 2);
    for i in 0..count {
        let key = format!("expand{i}");
        assert!(engine.get(key.as_bytes(), false).is_some(), "lost {key}");
    }
    check_invariants(&engine);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_rebalance_rescues_live_items() {
    let engine = engine_with(Settings {
        maxbytes: 8 * 64 * 1024,
        ..small_settings()
    });
    // Fill one class across several pages.
    let value = vec![b'v'; 900];
    let mut keys = Vec::new();
    for i in 0..150 {
        let key = format!("mv{i:03}");
        assert!(matches!(
            store(&engine, StoreMode::Set, key.as_bytes(), &value, 0, 0),
            StoreOutcome::Stored { .. }
        ));
        keys.push(key);
    }
    let src = engine.get(keys[0].as_bytes(), false).unwrap().meta.clsid;
    let dst = if src == 1 { 2 } else { 1 };
    assert!(engine.slabs().class(src).inner.lock().page_count() >= 2);

    let shutdown = tokio_util::sync::CancellationToken::new();
    let task = tokio::spawn(crate::slab::rebalance::rebalancer_task(
        Arc::clone(&engine),
        shutdown.clone(),
    ));
    assert_eq!(
        engine.slabs_reassign(src, dst),
        crate::slab::rebalance::ReassignResult::Ok
    );
    // Busy-wait (virtual time) until the move completes.
    for _ in 0..1000 {
        if engine.rebalance.lock().plan.is_none() {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert!(engine.rebalance.lock().plan.is_none(), "move never finished");
    shutdown.cancel();
    let _ = task.await;

    // No silent data loss: every key still resolves to its value.
    for key in &keys {
        let item = engine.get(key.as_bytes(), false).expect("survived move");
        assert_eq!(item.read_value(), value);
    }
    // The destination class owns a page now.
    assert!(engine.slabs().class(dst).inner.lock().page_count() >= 1);
    check_invariants(&engine);
}

#[tokio::test(flavor = "current_thread", start_paused = true)]
async fn test_crawler_reclaims_expired() {
    let engine = engine();
    let now = engine.clock().now();
    for i in 0..20 {
        let key = format!("c{i}");
        store(&engine, StoreMode::Set, key.as_bytes(), b"v", now + 1, 0);
    }
    engine.clock().set(now + 10);
    let shutdown = tokio_util::sync::CancellationToken::new();
    let mut total = 0;
    for cls in engine.all_class_ids() {
        total += engine.crawl_class(cls, 0, 0, &shutdown).await;
    }
    assert_eq!(total, 20);
    assert_eq!(engine.curr_items(), 0);
    check_invariants(&engine);
}

#[test]
fn test_metadump_lists_live_items() {
    let engine = engine();
    set(&engine, b"alpha", b"1");
    set(&engine, b"beta/2", b"2");
    let dump = engine.metadump(&engine.all_class_ids());
    let text = String::from_utf8(dump).unwrap();
    assert!(text.contains("key=alpha "));
    // Non-token bytes are percent-encoded.
    assert!(text.contains("key=beta%2F2 "));
    assert!(text.ends_with("END\r\n"));
}

#[test]
fn test_fetched_flag_set_on_first_get() {
    let engine = engine();
    set(&engine, b"k", b"v");
    let first = engine.get(b"k", true).unwrap();
    assert!(!first.meta.fetched);
    drop(first);
    let second = engine.get(b"k", true).unwrap();
    assert!(second.meta.fetched);
}
