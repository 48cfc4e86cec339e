//! Protocol codecs.
//!
//! Both wire protocols normalize into [`Command`]; the connection machine
//! dispatches commands against the store and renders replies in whichever
//! protocol the client spoke.

pub mod ascii;
pub mod binary;

use crate::store::StoreMode;

/// Which classes a crawler command targets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlTargets {
    All,
    Classes(Vec<u8>),
}

/// `slabs ...` admin subcommands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlabsCmd {
    Reassign { src: u8, dst: u8 },
    Automove { level: u8 },
}

/// `lru_crawler ...` admin subcommands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrawlerCmd {
    Enable,
    Disable,
    Crawl(CrawlTargets),
    Metadump(CrawlTargets),
    Sleep(u32),
    Tocrawl(u64),
}

/// One parsed client command, shared by both protocols.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `get`/`gets`, or `gat`/`gats` when `touch` carries a new expiry.
    Get {
        keys: Vec<Vec<u8>>,
        with_cas: bool,
        touch: Option<i64>,
    },
    /// All six storage verbs; the value body follows separately.
    Store {
        mode: StoreMode,
        key: Vec<u8>,
        flags: u32,
        exptime: i64,
        vlen: usize,
        req_cas: u64,
        noreply: bool,
    },
    Delete {
        key: Vec<u8>,
        noreply: bool,
    },
    Arith {
        key: Vec<u8>,
        incr: bool,
        delta: u64,
        noreply: bool,
    },
    Touch {
        key: Vec<u8>,
        exptime: i64,
        noreply: bool,
    },
    FlushAll {
        delay: i64,
        noreply: bool,
    },
    Stats {
        arg: Option<String>,
    },
    Version,
    Verbosity {
        level: u32,
        noreply: bool,
    },
    Quit,
    Slabs(SlabsCmd),
    LruCrawler(CrawlerCmd),
}
