//! Server-wide statistics counters.
//!
//! Counters are plain atomics so the command path never takes a lock to
//! record an event; `stats` renders a snapshot on demand.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($($(#[$meta:meta])* $name:ident),+ $(,)?) => {
        /// Monotonic event counters, reset by `stats reset`.
        #[derive(Debug, Default)]
        pub struct Stats {
            $($(#[$meta])* pub $name: AtomicU64,)+
        }

        impl Stats {
            pub fn new() -> Self {
                Self::default()
            }

            /// Clear every counter (the `stats reset` command).
            pub fn reset(&self) {
                $(self.$name.store(0, Ordering::Relaxed);)+
            }
        }
    };
}

counters! {
    cmd_get,
    cmd_set,
    cmd_touch,
    cmd_flush,
    get_hits,
    get_misses,
    /// Lookups that found only an expired item.
    get_expired,
    /// Lookups that found only an item below the flush watermark.
    get_flushed,
    delete_hits,
    delete_misses,
    incr_hits,
    incr_misses,
    decr_hits,
    decr_misses,
    cas_hits,
    cas_misses,
    cas_badval,
    touch_hits,
    touch_misses,
    /// Items stored since start (not a gauge).
    total_items,
    /// COLD-tail evictions to make room.
    evictions,
    /// Items freed because they had expired.
    reclaimed,
    /// Evicted without ever being fetched.
    evicted_unfetched,
    /// Reclaimed without ever being fetched.
    expired_unfetched,
    /// Tail items force-freed after tail_repair_time.
    tailrepairs,
    /// Allocation failures reported to clients.
    outofmemory,
    /// Pages moved by the slab rebalancer.
    slabs_moved,
    total_connections,
    /// Accepts refused because maxconns was reached.
    rejected_connections,
    /// Connections closed by the idle reaper.
    idle_kicks,
    bytes_read,
    bytes_written,
}

impl Stats {
    #[inline]
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::Relaxed)
    }
}
