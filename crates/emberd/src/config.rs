//! Daemon configuration
//!
//! Settings are resolved in three layers: built-in defaults, an optional
//! JSON config file (`EMBERD_CONFIG=<path>`), then `EMBERD_*` environment
//! variables. Later layers win.

use serde::{Deserialize, Serialize};
use std::path::Path;
use thiserror::Error;

/// Hash function used for key hashing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    Jenkins,
    Murmur3,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid setting {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("cannot read config file {path}: {source}")]
    File {
        path: String,
        source: std::io::Error,
    },
    #[error("cannot parse config file {path}: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
}

/// Runtime settings for the cache daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct Settings {
    /// TCP listen address; empty string disables TCP
    pub tcp_addr: String,
    /// UDP listen address; empty string disables UDP
    pub udp_addr: String,
    /// Unix domain socket path; empty string disables the unix listener
    pub unix_path: String,
    /// Access mask for the unix socket file (octal, e.g. 0o700)
    pub unix_mask: u32,

    /// Slab allocator memory budget in bytes
    pub maxbytes: usize,
    /// Chunk size growth factor between slab classes
    pub factor: f64,
    /// Smallest chunk size (key + value + overhead)
    pub chunk_size: usize,
    /// Maximum stored value size in bytes
    pub item_size_max: usize,
    /// Slab page size in bytes
    pub slab_page_size: usize,
    /// Largest chunk carved from a page; larger values are chained
    pub slab_chunk_size_max: usize,

    /// Maximum simultaneous connections
    pub maxconns: usize,
    /// Listen backlog
    pub backlog: u32,
    /// Commands processed per connection before yielding to the runtime
    pub reqs_per_event: u32,
    /// Worker threads for the async runtime
    pub num_threads: usize,

    /// Allow page reassignment between slab classes
    pub slab_reassign: bool,
    /// Automatic page mover: 0 = off, 1 = conservative, 2 = aggressive
    pub slab_automove: u8,
    /// Eviction-rate ratio that triggers an automatic move
    pub slab_automove_ratio: f64,
    /// Sliding window length (seconds) for the automover
    pub slab_automove_window: u32,

    /// Enable the LRU crawler background task
    pub lru_crawler: bool,
    /// Microseconds the crawler sleeps between items
    pub lru_crawler_sleep: u32,
    /// Max items examined per crawl; 0 = unbounded
    pub lru_crawler_tocrawl: u64,
    /// Enable the LRU maintainer background task
    pub lru_maintainer_thread: bool,
    /// Use the segmented (HOT/WARM/COLD) LRU
    pub lru_segmented: bool,
    /// Percent of class memory admitted to HOT
    pub hot_lru_pct: u8,
    /// Percent of class memory admitted to WARM
    pub warm_lru_pct: u8,
    /// HOT tail age cap as a multiple of COLD tail age
    pub hot_max_factor: f64,
    /// WARM tail age cap as a multiple of COLD tail age
    pub warm_max_factor: f64,

    /// Keep short-TTL items on a separate TEMP LRU
    pub temp_lru: bool,
    /// Expiry ceiling (seconds) for TEMP LRU admission
    pub temporary_ttl: u32,

    /// Issue CAS identifiers on stores
    pub use_cas: bool,
    /// Allow the flush_all command
    pub flush_enabled: bool,
    /// Allow lru_crawler metadump
    pub dump_enabled: bool,

    /// Seconds before an idle connection is closed; 0 = never
    pub idle_timeout: u32,
    /// Seconds after which a ref-leaked tail item is reclaimed; 0 = never
    pub tail_repair_time: u32,

    /// Initial hash table power (buckets = 2^n); 0 = default (16)
    pub hashpower_init: u8,
    /// Key hash function
    pub hash_algorithm: HashAlgorithm,

    /// Log verbosity knob mirrored by the `verbosity` command
    pub verbose: u8,
}

/// Default hash power when `hashpower_init` is 0 (64K buckets).
pub const HASHPOWER_DEFAULT: u8 = 16;

/// Floor applied to a configured `tail_repair_time`.
pub const TAIL_REPAIR_TIME_MIN: u32 = 10;

impl Default for Settings {
    fn default() -> Self {
        let slab_page_size = 1024 * 1024;
        Self {
            tcp_addr: "0.0.0.0:11211".to_string(),
            udp_addr: String::new(),
            unix_path: String::new(),
            unix_mask: 0o700,

            maxbytes: 64 * 1024 * 1024,
            factor: 1.25,
            chunk_size: 48,
            item_size_max: 1024 * 1024,
            slab_page_size,
            slab_chunk_size_max: slab_page_size / 2,

            maxconns: 1024,
            backlog: 1024,
            reqs_per_event: 20,
            num_threads: 4,

            slab_reassign: true,
            slab_automove: 1,
            slab_automove_ratio: 0.8,
            slab_automove_window: 30,

            lru_crawler: false,
            lru_crawler_sleep: 100,
            lru_crawler_tocrawl: 0,
            lru_maintainer_thread: false,
            lru_segmented: true,
            hot_lru_pct: 20,
            warm_lru_pct: 40,
            hot_max_factor: 0.2,
            warm_max_factor: 2.0,

            temp_lru: false,
            temporary_ttl: 61,

            use_cas: true,
            flush_enabled: true,
            dump_enabled: true,

            idle_timeout: 0,
            tail_repair_time: 0,

            hashpower_init: 0,
            hash_algorithm: HashAlgorithm::Murmur3,

            verbose: 0,
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Settings {
    /// Load settings from the optional config file and environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = match std::env::var("EMBERD_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        settings.apply_env();
        settings.validate()?;
        Ok(settings)
    }

    /// Parse a JSON config file on top of the defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::File {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Override individual settings from `EMBERD_*` environment variables.
    pub fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("EMBERD_TCP_ADDR") {
            self.tcp_addr = addr;
        }
        if let Ok(addr) = std::env::var("EMBERD_UDP_ADDR") {
            self.udp_addr = addr;
        }
        if let Ok(path) = std::env::var("EMBERD_UNIX_PATH") {
            self.unix_path = path;
        }
        if let Some(v) = env_parse("EMBERD_MAXBYTES") {
            self.maxbytes = v;
        }
        if let Some(v) = env_parse("EMBERD_FACTOR") {
            self.factor = v;
        }
        if let Some(v) = env_parse("EMBERD_ITEM_SIZE_MAX") {
            self.item_size_max = v;
        }
        if let Some(v) = env_parse("EMBERD_MAXCONNS") {
            self.maxconns = v;
        }
        if let Some(v) = env_parse("EMBERD_NUM_THREADS") {
            self.num_threads = v;
        }
        if let Some(v) = env_parse("EMBERD_IDLE_TIMEOUT") {
            self.idle_timeout = v;
        }
        if let Some(v) = env_parse::<u8>("EMBERD_SLAB_AUTOMOVE") {
            self.slab_automove = v;
        }
        if let Some(v) = env_parse::<u8>("EMBERD_VERBOSE") {
            self.verbose = v;
        }
        if let Ok(v) = std::env::var("EMBERD_LRU_CRAWLER") {
            self.lru_crawler = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("EMBERD_LRU_MAINTAINER") {
            self.lru_maintainer_thread = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("EMBERD_TEMP_LRU") {
            self.temp_lru = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    /// Reject configurations the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(name: &'static str, reason: impl Into<String>) -> ConfigError {
            ConfigError::Invalid {
                name,
                reason: reason.into(),
            }
        }

        if self.factor <= 1.0 {
            return Err(invalid("factor", "growth factor must be greater than 1.0"));
        }
        if self.chunk_size < 48 {
            return Err(invalid("chunk_size", "minimum chunk size is 48"));
        }
        if !self.slab_page_size.is_power_of_two() {
            return Err(invalid("slab_page_size", "must be a power of two"));
        }
        if self.slab_chunk_size_max > self.slab_page_size {
            return Err(invalid(
                "slab_chunk_size_max",
                "cannot exceed slab_page_size",
            ));
        }
        if self.maxbytes < self.slab_page_size * 2 {
            return Err(invalid("maxbytes", "budget must cover at least two pages"));
        }
        if self.item_size_max < 1024 {
            return Err(invalid("item_size_max", "minimum is 1024 bytes"));
        }
        if self.num_threads == 0 {
            return Err(invalid("num_threads", "at least one worker is required"));
        }
        if self.hot_lru_pct as u32 + self.warm_lru_pct as u32 > 80 {
            return Err(invalid(
                "hot_lru_pct",
                "hot + warm percentages must leave room for COLD (<= 80)",
            ));
        }
        if self.hashpower_init != 0 && !(12..=32).contains(&self.hashpower_init) {
            return Err(invalid("hashpower_init", "must be 0 or within 12..=32"));
        }
        Ok(())
    }

    /// Initial hash table power, resolving the 0 default.
    pub fn hashpower(&self) -> u8 {
        if self.hashpower_init == 0 {
            HASHPOWER_DEFAULT
        } else {
            self.hashpower_init
        }
    }

    /// Effective tail repair time: 0 disables, otherwise clamped up to the floor.
    pub fn tail_repair(&self) -> u32 {
        if self.tail_repair_time == 0 {
            0
        } else {
            self.tail_repair_time.max(TAIL_REPAIR_TIME_MIN)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let settings = Settings::default();
        assert!(settings.validate().is_ok());
        assert_eq!(settings.maxbytes, 64 * 1024 * 1024);
        assert_eq!(settings.slab_chunk_size_max, settings.slab_page_size / 2);
        assert_eq!(settings.hashpower(), HASHPOWER_DEFAULT);
    }

    #[test]
    fn test_rejects_bad_factor() {
        let settings = Settings {
            factor: 1.0,
            ..Settings::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(ConfigError::Invalid { name: "factor", .. })
        ));
    }

    #[test]
    fn test_tail_repair_floor() {
        let settings = Settings {
            tail_repair_time: 3,
            ..Settings::default()
        };
        assert_eq!(settings.tail_repair(), TAIL_REPAIR_TIME_MIN);
        let off = Settings::default();
        assert_eq!(off.tail_repair(), 0);
    }

    #[test]
    fn test_config_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("emberd.json");
        std::fs::write(&path, r#"{"maxbytes": 134217728, "temp_lru": true}"#).unwrap();

        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.maxbytes, 128 * 1024 * 1024);
        assert!(settings.temp_lru);
        // Untouched fields keep their defaults
        assert_eq!(settings.factor, 1.25);
    }
}
