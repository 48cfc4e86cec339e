//! `stats` command renderers: point-in-time snapshots of engine state.

use super::lru::Segment;
use super::CacheEngine;
use crate::stats::Stats;
use std::sync::atomic::Ordering;

type StatList = Vec<(String, String)>;

fn push(out: &mut StatList, name: impl Into<String>, value: impl ToString) {
    out.push((name.into(), value.to_string()));
}

impl CacheEngine {
    /// Total accounting bytes of linked items.
    pub fn bytes_stored(&self) -> u64 {
        let mut total = 0;
        for cls in 1..=self.slabs().class_count() as u8 {
            let lru = self.lock_lru(cls);
            for seg in Segment::ALL {
                total += lru.list(seg).bytes;
            }
        }
        total
    }

    /// The plain `stats` listing. Connection gauges come from the server.
    pub fn stats_general(&self, curr_connections: u64) -> StatList {
        let stats = &self.stats;
        let mut out = Vec::with_capacity(48);
        push(&mut out, "pid", std::process::id());
        push(&mut out, "uptime", self.clock().now());
        push(
            &mut out,
            "time",
            self.clock().epoch_start() + self.clock().now() as i64,
        );
        push(&mut out, "version", env!("CARGO_PKG_VERSION"));
        push(&mut out, "pointer_size", 64);
        push(&mut out, "curr_connections", curr_connections);
        push(
            &mut out,
            "total_connections",
            Stats::get(&stats.total_connections),
        );
        push(
            &mut out,
            "rejected_connections",
            Stats::get(&stats.rejected_connections),
        );
        push(&mut out, "idle_kicks", Stats::get(&stats.idle_kicks));
        push(&mut out, "cmd_get", Stats::get(&stats.cmd_get));
        push(&mut out, "cmd_set", Stats::get(&stats.cmd_set));
        push(&mut out, "cmd_flush", Stats::get(&stats.cmd_flush));
        push(&mut out, "cmd_touch", Stats::get(&stats.cmd_touch));
        push(&mut out, "get_hits", Stats::get(&stats.get_hits));
        push(&mut out, "get_misses", Stats::get(&stats.get_misses));
        push(&mut out, "get_expired", Stats::get(&stats.get_expired));
        push(&mut out, "get_flushed", Stats::get(&stats.get_flushed));
        push(&mut out, "delete_hits", Stats::get(&stats.delete_hits));
        push(&mut out, "delete_misses", Stats::get(&stats.delete_misses));
        push(&mut out, "incr_hits", Stats::get(&stats.incr_hits));
        push(&mut out, "incr_misses", Stats::get(&stats.incr_misses));
        push(&mut out, "decr_hits", Stats::get(&stats.decr_hits));
        push(&mut out, "decr_misses", Stats::get(&stats.decr_misses));
        push(&mut out, "cas_hits", Stats::get(&stats.cas_hits));
        push(&mut out, "cas_misses", Stats::get(&stats.cas_misses));
        push(&mut out, "cas_badval", Stats::get(&stats.cas_badval));
        push(&mut out, "touch_hits", Stats::get(&stats.touch_hits));
        push(&mut out, "touch_misses", Stats::get(&stats.touch_misses));
        push(&mut out, "bytes_read", Stats::get(&stats.bytes_read));
        push(&mut out, "bytes_written", Stats::get(&stats.bytes_written));
        push(&mut out, "bytes", self.bytes_stored());
        push(&mut out, "curr_items", self.curr_items());
        push(&mut out, "total_items", Stats::get(&stats.total_items));
        push(&mut out, "evictions", Stats::get(&stats.evictions));
        push(&mut out, "reclaimed", Stats::get(&stats.reclaimed));
        push(
            &mut out,
            "expired_unfetched",
            Stats::get(&stats.expired_unfetched),
        );
        push(
            &mut out,
            "evicted_unfetched",
            Stats::get(&stats.evicted_unfetched),
        );
        push(&mut out, "slabs_moved", Stats::get(&stats.slabs_moved));
        push(&mut out, "limit_maxbytes", self.settings().maxbytes);
        push(&mut out, "threads", self.settings().num_threads);
        let buckets = self.bucket_count();
        push(
            &mut out,
            "hash_power_level",
            (buckets as f64).log2().round() as u32,
        );
        push(&mut out, "hash_bytes", buckets * 8);
        push(&mut out, "hash_is_expanding", u8::from(self.is_expanding()));
        push(
            &mut out,
            "slab_reassign_running",
            u8::from(self.rebalance.lock().plan.is_some()),
        );
        push(
            &mut out,
            "lru_crawler_running",
            u8::from(!self.crawler_queue.lock().is_empty()),
        );
        out
    }

    /// `stats settings`
    pub fn stats_settings(&self) -> StatList {
        let s = self.settings();
        let mut out = Vec::with_capacity(32);
        push(&mut out, "maxbytes", s.maxbytes);
        push(&mut out, "maxconns", s.maxconns);
        push(&mut out, "tcpport", s.tcp_addr.clone());
        push(&mut out, "udpport", s.udp_addr.clone());
        push(&mut out, "domain_socket", s.unix_path.clone());
        push(&mut out, "evictions", "on");
        push(&mut out, "growth_factor", s.factor);
        push(&mut out, "chunk_size", s.chunk_size);
        push(&mut out, "num_threads", s.num_threads);
        push(&mut out, "reqs_per_event", s.reqs_per_event);
        push(&mut out, "item_size_max", s.item_size_max);
        push(&mut out, "slab_page_size", s.slab_page_size);
        push(&mut out, "slab_chunk_max", s.slab_chunk_size_max);
        push(&mut out, "slab_reassign", s.slab_reassign);
        push(
            &mut out,
            "slab_automove",
            self.automove_level.load(Ordering::Relaxed),
        );
        push(&mut out, "slab_automove_ratio", s.slab_automove_ratio);
        push(&mut out, "slab_automove_window", s.slab_automove_window);
        push(
            &mut out,
            "lru_crawler",
            self.crawler_enabled.load(Ordering::Relaxed),
        );
        push(
            &mut out,
            "lru_crawler_sleep",
            self.crawler_sleep_us.load(Ordering::Relaxed),
        );
        push(
            &mut out,
            "lru_crawler_tocrawl",
            self.crawler_tocrawl.load(Ordering::Relaxed),
        );
        push(&mut out, "lru_maintainer_thread", s.lru_maintainer_thread);
        push(&mut out, "lru_segmented", s.lru_segmented);
        push(&mut out, "hot_lru_pct", s.hot_lru_pct);
        push(&mut out, "warm_lru_pct", s.warm_lru_pct);
        push(&mut out, "hot_max_factor", s.hot_max_factor);
        push(&mut out, "warm_max_factor", s.warm_max_factor);
        push(&mut out, "temp_lru", s.temp_lru);
        push(&mut out, "temporary_ttl", s.temporary_ttl);
        push(&mut out, "cas_enabled", s.use_cas);
        push(&mut out, "flush_enabled", s.flush_enabled);
        push(&mut out, "dump_enabled", s.dump_enabled);
        push(&mut out, "idle_timeout", s.idle_timeout);
        push(&mut out, "tail_repair_time", s.tail_repair());
        push(&mut out, "hashpower_init", s.hashpower());
        push(
            &mut out,
            "hash_algorithm",
            format!("{:?}", s.hash_algorithm).to_lowercase(),
        );
        push(
            &mut out,
            "verbosity",
            self.verbosity.load(Ordering::Relaxed),
        );
        out
    }

    /// `stats items`: per-class LRU counters for classes holding items.
    pub fn stats_items(&self) -> StatList {
        let now = self.clock().now();
        let mut out = Vec::new();
        for cls in 1..=self.slabs().class_count() as u8 {
            let lru = self.lock_lru(cls);
            let number = lru.total_count();
            if number == 0 {
                continue;
            }
            let prefix = format!("items:{cls}");
            let age = lru
                .tail(Segment::Cold)
                .map(|node| now.saturating_sub(lru.node(node).time))
                .unwrap_or(0);
            push(&mut out, format!("{prefix}:number"), number);
            push(
                &mut out,
                format!("{prefix}:number_hot"),
                lru.list(Segment::Hot).count,
            );
            push(
                &mut out,
                format!("{prefix}:number_warm"),
                lru.list(Segment::Warm).count,
            );
            push(
                &mut out,
                format!("{prefix}:number_cold"),
                lru.list(Segment::Cold).count,
            );
            push(
                &mut out,
                format!("{prefix}:number_temp"),
                lru.list(Segment::Temp).count,
            );
            push(&mut out, format!("{prefix}:age"), age);
            push(
                &mut out,
                format!("{prefix}:moves_to_warm"),
                lru.moves_to_warm,
            );
            push(
                &mut out,
                format!("{prefix}:moves_to_cold"),
                lru.moves_to_cold,
            );
            push(
                &mut out,
                format!("{prefix}:moves_within_lru"),
                lru.moves_within_lru,
            );
            for seg in Segment::ALL {
                push(
                    &mut out,
                    format!("{prefix}:hits_to_{}", seg.name()),
                    lru.hits[seg.index()],
                );
            }
            drop(lru);

            let class_stats = &self.slabs().class(cls).stats;
            push(
                &mut out,
                format!("{prefix}:evicted"),
                class_stats.evicted.load(Ordering::Relaxed),
            );
            push(
                &mut out,
                format!("{prefix}:evicted_time"),
                class_stats.evicted_time.load(Ordering::Relaxed),
            );
            push(
                &mut out,
                format!("{prefix}:evicted_unfetched"),
                class_stats.evicted_unfetched.load(Ordering::Relaxed),
            );
            push(
                &mut out,
                format!("{prefix}:expired_unfetched"),
                class_stats.expired_unfetched.load(Ordering::Relaxed),
            );
            push(
                &mut out,
                format!("{prefix}:reclaimed"),
                class_stats.reclaimed.load(Ordering::Relaxed),
            );
            push(
                &mut out,
                format!("{prefix}:outofmemory"),
                class_stats.outofmemory.load(Ordering::Relaxed),
            );
            push(
                &mut out,
                format!("{prefix}:tailrepairs"),
                class_stats.tailrepairs.load(Ordering::Relaxed),
            );
            push(
                &mut out,
                format!("{prefix}:crawler_reclaimed"),
                class_stats.crawler_reclaimed.load(Ordering::Relaxed),
            );
            push(
                &mut out,
                format!("{prefix}:lrutail_reflocked"),
                class_stats.lrutail_reflocked.load(Ordering::Relaxed),
            );
        }
        out
    }

    /// `stats slabs`: per-class page and chunk accounting.
    pub fn stats_slabs(&self) -> StatList {
        let mut out = Vec::new();
        let mut active = 0usize;
        for cls in 1..=self.slabs().class_count() as u8 {
            let class = self.slabs().class(cls);
            let inner = class.inner.lock();
            if inner.page_count() == 0 {
                continue;
            }
            active += 1;
            let prefix = format!("{cls}");
            push(&mut out, format!("{prefix}:chunk_size"), inner.chunk_size());
            push(&mut out, format!("{prefix}:chunks_per_page"), inner.perslab());
            push(&mut out, format!("{prefix}:total_pages"), inner.page_count());
            push(&mut out, format!("{prefix}:total_chunks"), inner.total_chunks());
            push(&mut out, format!("{prefix}:used_chunks"), inner.used_chunks());
            push(&mut out, format!("{prefix}:free_chunks"), inner.free_chunks());
            drop(inner);
            push(
                &mut out,
                format!("{prefix}:get_hits"),
                class.stats.get_hits.load(Ordering::Relaxed),
            );
            push(
                &mut out,
                format!("{prefix}:cmd_set"),
                class.stats.cmd_set.load(Ordering::Relaxed),
            );
        }
        push(&mut out, "active_slabs", active);
        push(
            &mut out,
            "total_malloced",
            self.slabs().pages_allocated() * self.slabs().page_size(),
        );
        out
    }
}
