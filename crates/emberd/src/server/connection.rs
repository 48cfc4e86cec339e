//! Per-connection state machine.
//!
//! Each accepted socket runs one task driving an explicit state machine:
//! parse one command, optionally stream a value body into a staged item,
//! assemble the reply as a segment list, write it vectored, repeat. At most
//! `reqs_per_event` commands run per scheduling slice before yielding back
//! to the runtime.

use crate::proto::binary::{self, Opcode, RequestHeader, Status};
use crate::proto::{ascii, Command, CrawlTargets, CrawlerCmd, SlabsCmd};
use crate::slab::rebalance::ReassignResult;
use crate::stats::Stats;
use crate::store::item::KEY_MAX_LENGTH;
use crate::store::{CacheEngine, DeltaOutcome, ItemRef, StagedItem, StoreError, StoreMode, StoreOutcome};
use std::io::IoSlice;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::ServerShared;

/// Read-buffer growth is bounded per event to cap memory per connection.
const READ_GROWTH_LIMIT: u32 = 4;

/// Initial read buffer size.
const READ_BUF_INIT: usize = 2048;

/// Scratch size when streaming a value body off the socket.
const BODY_CHUNK: usize = 16 * 1024;

/// Connection FSM states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    NewCmd,
    ParseCmd,
    Waiting,
    Read,
    Nread,
    Swallow,
    Mwrite,
    Closing,
}

/// Negotiated wire protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Proto {
    Negotiating,
    Ascii,
    Binary,
}

/// How to answer the command whose body is being read.
#[derive(Debug, Clone)]
pub enum PendingReply {
    Ascii { noreply: bool },
    Binary { opcode: Opcode, quiet: bool, opaque: u32 },
}

/// In-flight body read for a storage command.
struct Nread {
    staged: Option<StagedItem>,
    mode: StoreMode,
    req_cas: u64,
    remaining: usize,
    /// CRLF trailer bytes still expected (ASCII only).
    trailer: usize,
    trailer_seen: [u8; 2],
    reply: PendingReply,
    /// Error to emit instead of committing (alloc failures swallow first).
    fail: Option<&'static str>,
    fail_status: Option<Status>,
}

/// Shared per-connection bookkeeping the reaper can see.
pub struct ConnShared {
    pub last_cmd: AtomicU32,
    /// True while the connection sits in NewCmd/Waiting/Read.
    pub idle_eligible: AtomicBool,
    pub kill: CancellationToken,
}

pub struct Connection<S> {
    stream: S,
    engine: Arc<CacheEngine>,
    server: Arc<ServerShared>,
    shared: Arc<ConnShared>,
    id: u64,
    state: ConnState,
    proto: Proto,
    rbuf: Vec<u8>,
    rcurr: usize,
    reads_this_event: u32,
    reqs_left: u32,
    nread: Option<Nread>,
    swallow: usize,
    /// Error reply to emit once a swallow completes.
    swallow_then: Option<Vec<u8>>,
    resp: Vec<Vec<u8>>,
    ilist: Vec<ItemRef>,
    write_and_go: ConnState,
    close_after_write: bool,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(
        stream: S,
        engine: Arc<CacheEngine>,
        server: Arc<ServerShared>,
        shared: Arc<ConnShared>,
        id: u64,
    ) -> Self {
        let reqs = engine.settings().reqs_per_event.max(1);
        Self {
            stream,
            engine,
            server,
            shared,
            id,
            state: ConnState::NewCmd,
            proto: Proto::Negotiating,
            rbuf: Vec::with_capacity(READ_BUF_INIT),
            rcurr: 0,
            reads_this_event: 0,
            reqs_left: reqs,
            nread: None,
            swallow: 0,
            swallow_then: None,
            resp: Vec::new(),
            ilist: Vec::new(),
            write_and_go: ConnState::NewCmd,
            close_after_write: false,
        }
    }

    fn pending(&self) -> &[u8] {
        &self.rbuf[self.rcurr..]
    }

    fn consume(&mut self, n: usize) {
        self.rcurr += n;
        debug_assert!(self.rcurr <= self.rbuf.len());
    }

    fn mark_active(&self) {
        self.shared
            .last_cmd
            .store(self.engine.clock().now(), Ordering::Relaxed);
    }

    fn set_idle_eligible(&self, idle: bool) {
        self.shared.idle_eligible.store(idle, Ordering::Relaxed);
    }

    /// Queue one reply segment.
    fn out(&mut self, bytes: Vec<u8>) {
        self.resp.push(bytes);
    }

    fn out_line(&mut self, text: &str) {
        let mut line = Vec::with_capacity(text.len() + 2);
        line.extend_from_slice(text.as_bytes());
        line.extend_from_slice(b"\r\n");
        self.resp.push(line);
    }

    /// Drive the machine until the connection closes.
    pub async fn run(mut self) {
        loop {
            match self.state {
                ConnState::NewCmd => {
                    if self.reqs_left == 0 {
                        // Fairness: let other connections run.
                        tokio::task::yield_now().await;
                        self.reqs_left = self.engine.settings().reqs_per_event.max(1);
                    }
                    self.reqs_left -= 1;
                    self.reads_this_event = 0;
                    self.state = ConnState::ParseCmd;
                }
                ConnState::ParseCmd => self.parse_step(),
                ConnState::Waiting => {
                    // Compact consumed bytes before blocking on the socket.
                    if self.rcurr > 0 {
                        self.rbuf.drain(..self.rcurr);
                        self.rcurr = 0;
                    }
                    self.state = ConnState::Read;
                }
                ConnState::Read => {
                    self.set_idle_eligible(true);
                    let read = self.read_step().await;
                    self.set_idle_eligible(false);
                    match read {
                        Ok(0) => self.state = ConnState::Closing,
                        Ok(_) => self.state = ConnState::ParseCmd,
                        Err(_) => self.state = ConnState::Closing,
                    }
                }
                ConnState::Nread => {
                    if let Err(()) = self.nread_step().await {
                        self.state = ConnState::Closing;
                    }
                }
                ConnState::Swallow => {
                    if let Err(()) = self.swallow_step().await {
                        self.state = ConnState::Closing;
                    }
                }
                ConnState::Mwrite => {
                    let result = self.write_segments().await;
                    self.resp.clear();
                    self.ilist.clear();
                    match result {
                        Ok(()) if !self.close_after_write => {
                            self.state = self.write_and_go;
                            self.write_and_go = ConnState::NewCmd;
                        }
                        _ => self.state = ConnState::Closing,
                    }
                }
                ConnState::Closing => {
                    self.ilist.clear();
                    self.server.forget(self.id);
                    debug!(conn = self.id, "connection closed");
                    return;
                }
            }
        }
    }

    /// Pull bytes off the socket into the read buffer, growing it at most
    /// [`READ_GROWTH_LIMIT`] times per event.
    async fn read_step(&mut self) -> std::io::Result<usize> {
        if self.rbuf.len() == self.rbuf.capacity() {
            if self.reads_this_event >= READ_GROWTH_LIMIT {
                // Yield before growing further.
                tokio::task::yield_now().await;
                self.reads_this_event = 0;
            }
            self.rbuf.reserve(self.rbuf.capacity().max(READ_BUF_INIT));
            self.reads_this_event += 1;
        }
        let kill = self.shared.kill.clone();
        let n = tokio::select! {
            read = self.stream.read_buf(&mut self.rbuf) => read?,
            _ = kill.cancelled() => {
                Stats::bump(&self.engine.stats.idle_kicks);
                return Ok(0);
            }
        };
        Stats::add(&self.engine.stats.bytes_read, n as u64);
        Ok(n)
    }

    /// Detect protocol and parse one command from the buffer.
    fn parse_step(&mut self) {
        if self.pending().is_empty() {
            self.state = ConnState::Waiting;
            return;
        }
        if self.proto == Proto::Negotiating {
            self.proto = if self.pending()[0] == binary::MAGIC_REQUEST {
                Proto::Binary
            } else {
                Proto::Ascii
            };
            debug!(conn = self.id, protocol = ?self.proto, "protocol negotiated");
        }
        self.mark_active();
        match self.proto {
            Proto::Ascii => self.parse_ascii(),
            Proto::Binary => self.parse_binary(),
            Proto::Negotiating => unreachable!(),
        }
    }

    // ── ASCII path ─────────────────────────────────────────────────────

    fn parse_ascii(&mut self) {
        match ascii::parse(self.pending()) {
            ascii::ParseResult::Incomplete => self.state = ConnState::Waiting,
            ascii::ParseResult::Broken => self.state = ConnState::Closing,
            ascii::ParseResult::Line { consumed, parsed } => {
                self.consume(consumed);
                match parsed {
                    ascii::Parsed::Unknown => {
                        self.out_line("ERROR");
                        self.finish_reply(false);
                    }
                    ascii::Parsed::ClientError(msg) => {
                        self.out_line(&format!("CLIENT_ERROR {msg}"));
                        self.finish_reply(false);
                    }
                    ascii::Parsed::Cmd(cmd) => self.dispatch_ascii(cmd),
                }
            }
        }
    }

    /// Transition to writing whatever has been queued.
    fn finish_reply(&mut self, noreply: bool) {
        if noreply {
            self.resp.clear();
            self.ilist.clear();
            self.state = ConnState::NewCmd;
        } else {
            self.state = ConnState::Mwrite;
        }
    }

    fn dispatch_ascii(&mut self, cmd: Command) {
        match cmd {
            Command::Get {
                keys,
                with_cas,
                touch,
            } => {
                self.do_get(keys, with_cas, touch);
                self.finish_reply(false);
            }
            Command::Store {
                mode,
                key,
                flags,
                exptime,
                vlen,
                req_cas,
                noreply,
            } => self.begin_store_ascii(mode, key, flags, exptime, vlen, req_cas, noreply),
            Command::Delete { key, noreply } => {
                let reply = if self.engine.delete(&key) {
                    Stats::bump(&self.engine.stats.delete_hits);
                    "DELETED"
                } else {
                    Stats::bump(&self.engine.stats.delete_misses);
                    "NOT_FOUND"
                };
                self.out_line(reply);
                self.finish_reply(noreply);
            }
            Command::Arith {
                key,
                incr,
                delta,
                noreply,
            } => {
                match self.engine.add_delta(&key, incr, delta) {
                    DeltaOutcome::Applied { value, .. } => {
                        let stat = if incr {
                            &self.engine.stats.incr_hits
                        } else {
                            &self.engine.stats.decr_hits
                        };
                        Stats::bump(stat);
                        self.out_line(&value.to_string());
                    }
                    DeltaOutcome::NotFound => {
                        let stat = if incr {
                            &self.engine.stats.incr_misses
                        } else {
                            &self.engine.stats.decr_misses
                        };
                        Stats::bump(stat);
                        self.out_line("NOT_FOUND");
                    }
                    DeltaOutcome::NonNumeric => {
                        self.out_line(
                            "CLIENT_ERROR cannot increment or decrement non-numeric value",
                        );
                    }
                }
                self.finish_reply(noreply);
            }
            Command::Touch {
                key,
                exptime,
                noreply,
            } => {
                Stats::bump(&self.engine.stats.cmd_touch);
                let exptime = self.engine.clock().realtime(exptime);
                let reply = match self.engine.touch(&key, exptime) {
                    Some(_item) => {
                        Stats::bump(&self.engine.stats.touch_hits);
                        "TOUCHED"
                    }
                    None => {
                        Stats::bump(&self.engine.stats.touch_misses);
                        "NOT_FOUND"
                    }
                };
                self.out_line(reply);
                self.finish_reply(noreply);
            }
            Command::FlushAll { delay, noreply } => {
                if self.engine.settings().flush_enabled {
                    let when = self.engine.clock().realtime(delay);
                    self.engine.flush_all(when);
                    self.out_line("OK");
                } else {
                    self.out_line("CLIENT_ERROR flush_all not allowed");
                }
                self.finish_reply(noreply);
            }
            Command::Stats { arg } => {
                self.do_stats(arg);
                self.finish_reply(false);
            }
            Command::Version => {
                self.out_line(&format!("VERSION {}", env!("CARGO_PKG_VERSION")));
                self.finish_reply(false);
            }
            Command::Verbosity { level, noreply } => {
                self.engine.verbosity.store(level, Ordering::Relaxed);
                self.out_line("OK");
                self.finish_reply(noreply);
            }
            Command::Quit => self.state = ConnState::Closing,
            Command::Slabs(cmd) => {
                self.do_slabs(cmd);
                self.finish_reply(false);
            }
            Command::LruCrawler(cmd) => {
                self.do_crawler(cmd);
                self.finish_reply(false);
            }
        }
    }

    fn do_get(&mut self, keys: Vec<Vec<u8>>, with_cas: bool, touch: Option<i64>) {
        let touching = touch.is_some();
        let exptime = touch.map(|t| self.engine.clock().realtime(t));
        for key in keys {
            if touching {
                Stats::bump(&self.engine.stats.cmd_touch);
            } else {
                Stats::bump(&self.engine.stats.cmd_get);
            }
            let item = match exptime {
                Some(exptime) => self.engine.touch(&key, exptime),
                None => self.engine.get(&key, true),
            };
            match item {
                Some(item) => {
                    if touching {
                        Stats::bump(&self.engine.stats.touch_hits);
                    } else {
                        Stats::bump(&self.engine.stats.get_hits);
                    }
                    let cas = with_cas.then_some(item.meta.cas);
                    self.out(ascii::value_header(
                        &key,
                        item.meta.flags,
                        item.meta.nbytes,
                        cas,
                    ));
                    let mut data = item.read_value();
                    data.extend_from_slice(b"\r\n");
                    self.out(data);
                    // Hold the reference until the reply is written out.
                    self.ilist.push(item);
                }
                None => {
                    if touching {
                        Stats::bump(&self.engine.stats.touch_misses);
                    } else {
                        Stats::bump(&self.engine.stats.get_misses);
                    }
                }
            }
        }
        self.out(b"END\r\n".to_vec());
    }

    #[allow(clippy::too_many_arguments)]
    fn begin_store_ascii(
        &mut self,
        mode: StoreMode,
        key: Vec<u8>,
        flags: u32,
        exptime: i64,
        vlen: usize,
        req_cas: u64,
        noreply: bool,
    ) {
        Stats::bump(&self.engine.stats.cmd_set);
        let exptime = self.engine.clock().realtime(exptime);
        let reply = PendingReply::Ascii { noreply };
        match self.engine.alloc_staged(&key, flags, exptime, vlen) {
            Ok(staged) => {
                self.nread = Some(Nread {
                    staged: Some(staged),
                    mode,
                    req_cas,
                    remaining: vlen,
                    trailer: 2,
                    trailer_seen: [0; 2],
                    reply,
                    fail: None,
                    fail_status: None,
                });
                self.state = ConnState::Nread;
            }
            Err(err) => {
                // Swallow the body to keep the stream framed, then report.
                let msg = match err {
                    StoreError::TooLarge => "SERVER_ERROR object too large for cache",
                    _ => "SERVER_ERROR out of memory storing object",
                };
                // A failed set must not leave stale data behind.
                if mode == StoreMode::Set {
                    self.engine.delete(&key);
                }
                self.nread = Some(Nread {
                    staged: None,
                    mode,
                    req_cas,
                    remaining: vlen,
                    trailer: 2,
                    trailer_seen: [0; 2],
                    reply,
                    fail: Some(msg),
                    fail_status: None,
                });
                self.state = ConnState::Nread;
            }
        }
    }

    fn do_stats(&mut self, arg: Option<String>) {
        let lines = match arg.as_deref() {
            None => self.engine.stats_general(self.server.curr_connections()),
            Some("settings") => self.engine.stats_settings(),
            Some("items") => self.engine.stats_items(),
            Some("slabs") => self.engine.stats_slabs(),
            Some("reset") => {
                self.engine.stats.reset();
                self.out_line("RESET");
                return;
            }
            Some(_) => {
                self.out_line("ERROR");
                return;
            }
        };
        let mut out = Vec::new();
        for (name, value) in lines {
            out.extend_from_slice(format!("STAT {name} {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"END\r\n");
        self.out(out);
    }

    fn do_slabs(&mut self, cmd: SlabsCmd) {
        match cmd {
            SlabsCmd::Reassign { src, dst } => {
                let reply = match self.engine.slabs_reassign(src, dst) {
                    ReassignResult::Ok => "OK",
                    ReassignResult::Running => "BUSY currently processing slab page",
                    ReassignResult::BadClass => "BADCLASS invalid src or dst class id",
                    ReassignResult::NoSpare => "NOSPARE source class has no spare pages",
                    ReassignResult::Same => "SAME src and dst class are identical",
                };
                self.out_line(reply);
            }
            SlabsCmd::Automove { level } => {
                self.engine
                    .automove_level
                    .store(level as u32, Ordering::Relaxed);
                self.out_line("OK");
            }
        }
    }

    fn do_crawler(&mut self, cmd: CrawlerCmd) {
        match cmd {
            CrawlerCmd::Enable => {
                self.engine.crawler_enabled.store(true, Ordering::Relaxed);
                self.out_line("OK");
            }
            CrawlerCmd::Disable => {
                self.engine.crawler_enabled.store(false, Ordering::Relaxed);
                self.out_line("OK");
            }
            CrawlerCmd::Sleep(us) => {
                self.engine.crawler_sleep_us.store(us, Ordering::Relaxed);
                self.out_line("OK");
            }
            CrawlerCmd::Tocrawl(count) => {
                self.engine.crawler_tocrawl.store(count, Ordering::Relaxed);
                self.out_line("OK");
            }
            CrawlerCmd::Crawl(targets) => {
                let classes = match targets {
                    CrawlTargets::All => self.engine.all_class_ids(),
                    CrawlTargets::Classes(classes) => classes,
                };
                if self.engine.crawl_request(&classes) {
                    self.out_line("OK");
                } else {
                    self.out_line("CLIENT_ERROR lru crawler disabled");
                }
            }
            CrawlerCmd::Metadump(targets) => {
                if !self.engine.settings().dump_enabled {
                    self.out_line("CLIENT_ERROR stat dumping is disabled");
                    return;
                }
                let classes = match targets {
                    CrawlTargets::All => self.engine.all_class_ids(),
                    CrawlTargets::Classes(classes) => classes,
                };
                let dump = self.engine.metadump(&classes);
                self.out(dump);
            }
        }
    }

    // ── body streaming ─────────────────────────────────────────────────

    /// Move value bytes from the buffer/socket into the staged item, then
    /// commit and reply.
    async fn nread_step(&mut self) -> Result<(), ()> {
        let mut nread = self.nread.take().expect("nread state");

        while nread.remaining > 0 {
            if self.pending().is_empty() {
                if self.rcurr > 0 {
                    self.rbuf.drain(..self.rcurr);
                    self.rcurr = 0;
                }
                let n = self.read_body_chunk(&mut nread).await.map_err(|_| ())?;
                if n == 0 {
                    return Err(());
                }
                continue;
            }
            let take = self.pending().len().min(nread.remaining);
            let start = self.rcurr;
            if let Some(staged) = nread.staged.as_mut() {
                staged.write(&self.rbuf[start..start + take]);
            }
            self.consume(take);
            nread.remaining -= take;
        }

        // ASCII values carry a CRLF trailer.
        while nread.trailer > 0 {
            if self.pending().is_empty() {
                if self.rcurr > 0 {
                    self.rbuf.drain(..self.rcurr);
                    self.rcurr = 0;
                }
                let n = self.read_step().await.map_err(|_| ())?;
                if n == 0 {
                    return Err(());
                }
                continue;
            }
            let byte = self.pending()[0];
            nread.trailer_seen[2 - nread.trailer] = byte;
            self.consume(1);
            nread.trailer -= 1;
        }
        let trailer_ok = matches!(nread.reply, PendingReply::Binary { .. })
            || &nread.trailer_seen == b"\r\n";

        self.complete_nread(nread, trailer_ok);
        Ok(())
    }

    /// Read body bytes straight into the staged item, bypassing the read
    /// buffer so large values never inflate it.
    async fn read_body_chunk(&mut self, nread: &mut Nread) -> std::io::Result<usize> {
        let mut scratch = [0u8; BODY_CHUNK];
        let want = nread.remaining.min(BODY_CHUNK);
        let kill = self.shared.kill.clone();
        let n = tokio::select! {
            read = self.stream.read(&mut scratch[..want]) => read?,
            _ = kill.cancelled() => return Ok(0),
        };
        if n > 0 {
            Stats::add(&self.engine.stats.bytes_read, n as u64);
            if let Some(staged) = nread.staged.as_mut() {
                staged.write(&scratch[..n]);
            }
            nread.remaining -= n;
        }
        Ok(n)
    }

    fn complete_nread(&mut self, nread: Nread, trailer_ok: bool) {
        let reply = nread.reply.clone();
        if !trailer_ok {
            drop(nread.staged);
            match reply {
                PendingReply::Ascii { .. } => {
                    self.out_line("CLIENT_ERROR bad data chunk");
                    self.finish_reply(false);
                }
                PendingReply::Binary { opcode, opaque, .. } => {
                    self.bin_error(opcode, opaque, Status::InvalidArguments);
                    self.finish_reply(false);
                }
            }
            return;
        }
        if let Some(msg) = nread.fail {
            Stats::bump(&self.engine.stats.outofmemory);
            match reply {
                PendingReply::Ascii { .. } => {
                    self.out_line(msg);
                    self.finish_reply(false);
                }
                PendingReply::Binary { opcode, opaque, .. } => {
                    let status = nread.fail_status.unwrap_or(Status::OutOfMemory);
                    self.bin_error(opcode, opaque, status);
                    self.finish_reply(false);
                }
            }
            return;
        }

        let staged = nread.staged.expect("staged item");
        let mode = nread.mode;
        let outcome = staged.commit(mode, nread.req_cas);
        if mode == StoreMode::Cas {
            match outcome {
                StoreOutcome::Stored { .. } => Stats::bump(&self.engine.stats.cas_hits),
                StoreOutcome::Exists => Stats::bump(&self.engine.stats.cas_badval),
                StoreOutcome::NotFound => Stats::bump(&self.engine.stats.cas_misses),
                StoreOutcome::NotStored => {}
            }
        }
        match reply {
            PendingReply::Ascii { noreply } => {
                let text = match outcome {
                    StoreOutcome::Stored { .. } => "STORED",
                    StoreOutcome::NotStored => "NOT_STORED",
                    StoreOutcome::Exists => "EXISTS",
                    StoreOutcome::NotFound => "NOT_FOUND",
                };
                self.out_line(text);
                self.finish_reply(noreply);
            }
            PendingReply::Binary {
                opcode,
                quiet,
                opaque,
            } => {
                match outcome {
                    StoreOutcome::Stored { cas } => {
                        if quiet {
                            self.finish_reply(true);
                        } else {
                            self.out(binary::response(
                                opcode as u8,
                                Status::NoError,
                                opaque,
                                cas,
                                &[],
                                &[],
                                &[],
                            ));
                            self.finish_reply(false);
                        }
                    }
                    StoreOutcome::NotStored => {
                        self.bin_error(opcode, opaque, Status::NotStored);
                        self.finish_reply(false);
                    }
                    StoreOutcome::Exists => {
                        self.bin_error(opcode, opaque, Status::KeyExists);
                        self.finish_reply(false);
                    }
                    StoreOutcome::NotFound => {
                        self.bin_error(opcode, opaque, Status::KeyNotFound);
                        self.finish_reply(false);
                    }
                }
            }
        }
    }

    /// Discard `swallow` bytes, then emit the queued error (ASCII).
    async fn swallow_step(&mut self) -> Result<(), ()> {
        while self.swallow > 0 {
            if self.pending().is_empty() {
                if self.rcurr > 0 {
                    self.rbuf.drain(..self.rcurr);
                    self.rcurr = 0;
                }
                let n = self.read_step().await.map_err(|_| ())?;
                if n == 0 {
                    return Err(());
                }
                continue;
            }
            let take = self.pending().len().min(self.swallow);
            self.consume(take);
            self.swallow -= take;
        }
        if let Some(line) = self.swallow_then.take() {
            self.out(line);
            self.finish_reply(false);
        } else {
            self.state = ConnState::NewCmd;
        }
        Ok(())
    }

    // ── binary path ────────────────────────────────────────────────────

    fn bin_error(&mut self, opcode: Opcode, opaque: u32, status: Status) {
        let body = binary::status_text(status);
        self.out(binary::response(
            opcode as u8,
            status,
            opaque,
            0,
            &[],
            &[],
            body,
        ));
    }

    fn parse_binary(&mut self) {
        let pending = self.pending();
        if pending.len() < binary::HEADER_LEN {
            self.state = ConnState::Waiting;
            return;
        }
        let header_bytes: [u8; binary::HEADER_LEN] =
            pending[..binary::HEADER_LEN].try_into().expect("header slice");
        let header = match RequestHeader::parse(&header_bytes) {
            Ok(header) => header,
            Err(bad) => {
                // Framing is unrecoverable: one error reply, then close.
                debug!(conn = self.id, magic = bad.0, "invalid binary magic");
                self.out(binary::response(
                    header_bytes[1],
                    Status::InvalidArguments,
                    0,
                    0,
                    &[],
                    &[],
                    binary::status_text(Status::InvalidArguments),
                ));
                self.close_after_write = true;
                self.finish_reply(false);
                return;
            }
        };

        let Some(opcode) = Opcode::from_u8(header.opcode) else {
            self.consume(binary::HEADER_LEN);
            self.swallow = header.bodylen as usize;
            let reply = binary::response(
                header.opcode,
                Status::UnknownCommand,
                header.opaque,
                0,
                &[],
                &[],
                binary::status_text(Status::UnknownCommand),
            );
            if self.swallow > 0 {
                self.swallow_then = Some(reply);
                self.state = ConnState::Swallow;
            } else {
                self.out(reply);
                self.finish_reply(false);
            }
            return;
        };

        if !header.is_framed() {
            self.consume(binary::HEADER_LEN);
            self.bin_error(opcode, header.opaque, Status::InvalidArguments);
            self.close_after_write = true;
            self.finish_reply(false);
            return;
        }

        // Storage opcodes stream their value; everything else is small
        // enough to require inline.
        let base = opcode.base();
        let inline_need = match base {
            Opcode::Set | Opcode::Add | Opcode::Replace | Opcode::Append | Opcode::Prepend => {
                binary::HEADER_LEN + header.extlen as usize + header.keylen as usize
            }
            _ => binary::HEADER_LEN + header.bodylen as usize,
        };
        if self.pending().len() < inline_need {
            self.state = ConnState::Waiting;
            return;
        }

        self.consume(binary::HEADER_LEN);
        let extras: Vec<u8> = {
            let extlen = header.extlen as usize;
            let bytes = self.pending()[..extlen].to_vec();
            self.consume(extlen);
            bytes
        };
        let key: Vec<u8> = {
            let keylen = header.keylen as usize;
            let bytes = self.pending()[..keylen].to_vec();
            self.consume(keylen);
            bytes
        };

        self.dispatch_binary(opcode, header, extras, key);
    }

    fn bin_protocol_error(&mut self, opcode: Opcode, opaque: u32, remaining_body: usize) {
        self.bin_error(opcode, opaque, Status::InvalidArguments);
        self.swallow = remaining_body;
        self.close_after_write = true;
        if self.swallow > 0 {
            let reply = self.resp.pop().expect("queued error");
            self.swallow_then = Some(reply);
            self.state = ConnState::Swallow;
        } else {
            self.finish_reply(false);
        }
    }

    fn dispatch_binary(
        &mut self,
        opcode: Opcode,
        header: RequestHeader,
        extras: Vec<u8>,
        key: Vec<u8>,
    ) {
        let base = opcode.base();
        let quiet = opcode.is_quiet();
        let opaque = header.opaque;
        let extlen = header.extlen as usize;
        let keylen = header.keylen as usize;
        let bodylen = header.bodylen as usize;
        let value_len = bodylen - extlen - keylen;

        if keylen > KEY_MAX_LENGTH {
            self.bin_protocol_error(opcode, opaque, value_len);
            return;
        }

        match base {
            Opcode::Version => {
                if extlen != 0 || keylen != 0 || bodylen != 0 {
                    self.bin_protocol_error(opcode, opaque, value_len);
                    return;
                }
                let version = env!("CARGO_PKG_VERSION").as_bytes();
                self.out(binary::response(
                    opcode as u8,
                    Status::NoError,
                    opaque,
                    0,
                    &[],
                    &[],
                    version,
                ));
                self.finish_reply(false);
            }
            Opcode::Noop => {
                if extlen != 0 || keylen != 0 || bodylen != 0 {
                    self.bin_protocol_error(opcode, opaque, value_len);
                    return;
                }
                self.out(binary::response(
                    opcode as u8,
                    Status::NoError,
                    opaque,
                    0,
                    &[],
                    &[],
                    &[],
                ));
                self.finish_reply(false);
            }
            Opcode::Quit => {
                if quiet {
                    self.state = ConnState::Closing;
                } else {
                    self.out(binary::response(
                        opcode as u8,
                        Status::NoError,
                        opaque,
                        0,
                        &[],
                        &[],
                        &[],
                    ));
                    self.close_after_write = true;
                    self.finish_reply(false);
                }
            }
            Opcode::Flush => {
                if keylen != 0 || bodylen != extlen || !(extlen == 0 || extlen == 4) {
                    self.bin_protocol_error(opcode, opaque, value_len);
                    return;
                }
                if self.engine.settings().flush_enabled {
                    let delay = if extlen == 4 {
                        u32::from_be_bytes(extras[..4].try_into().expect("flush extras")) as i64
                    } else {
                        0
                    };
                    let when = self.engine.clock().realtime(delay);
                    self.engine.flush_all(when);
                }
                if quiet {
                    self.finish_reply(true);
                } else {
                    self.out(binary::response(
                        opcode as u8,
                        Status::NoError,
                        opaque,
                        0,
                        &[],
                        &[],
                        &[],
                    ));
                    self.finish_reply(false);
                }
            }
            Opcode::Get | Opcode::GetK => {
                if extlen != 0 || bodylen != keylen || keylen == 0 {
                    self.bin_protocol_error(opcode, opaque, value_len);
                    return;
                }
                self.bin_get(opcode, opaque, &key, None);
            }
            Opcode::Touch | Opcode::Gat | Opcode::GatK => {
                if extlen != 4 || keylen == 0 {
                    self.bin_protocol_error(opcode, opaque, value_len);
                    return;
                }
                let exptime =
                    u32::from_be_bytes(extras[..4].try_into().expect("touch extras")) as i64;
                let exptime = self.engine.clock().realtime(exptime);
                Stats::bump(&self.engine.stats.cmd_touch);
                if base == Opcode::Touch {
                    match self.engine.touch(&key, exptime) {
                        Some(item) => {
                            Stats::bump(&self.engine.stats.touch_hits);
                            self.out(binary::response(
                                opcode as u8,
                                Status::NoError,
                                opaque,
                                item.meta.cas,
                                &[],
                                &[],
                                &[],
                            ));
                            self.ilist.push(item);
                            self.finish_reply(false);
                        }
                        None => {
                            Stats::bump(&self.engine.stats.touch_misses);
                            self.bin_error(opcode, opaque, Status::KeyNotFound);
                            self.finish_reply(false);
                        }
                    }
                } else {
                    self.bin_get(opcode, opaque, &key, Some(exptime));
                }
            }
            Opcode::Delete => {
                if keylen == 0 || extlen != 0 || bodylen != keylen {
                    self.bin_protocol_error(opcode, opaque, value_len);
                    return;
                }
                if self.engine.delete(&key) {
                    Stats::bump(&self.engine.stats.delete_hits);
                    if quiet {
                        self.finish_reply(true);
                    } else {
                        self.out(binary::response(
                            opcode as u8,
                            Status::NoError,
                            opaque,
                            0,
                            &[],
                            &[],
                            &[],
                        ));
                        self.finish_reply(false);
                    }
                } else {
                    Stats::bump(&self.engine.stats.delete_misses);
                    self.bin_error(opcode, opaque, Status::KeyNotFound);
                    self.finish_reply(false);
                }
            }
            Opcode::Increment | Opcode::Decrement => {
                if keylen == 0 || extlen != 20 || bodylen != keylen + 20 {
                    self.bin_protocol_error(opcode, opaque, value_len);
                    return;
                }
                self.bin_arith(opcode, base == Opcode::Increment, opaque, &extras, &key);
            }
            Opcode::Set | Opcode::Add | Opcode::Replace => {
                if extlen != 8 || keylen == 0 || bodylen < keylen + 8 {
                    self.bin_protocol_error(opcode, opaque, value_len);
                    return;
                }
                let flags = u32::from_be_bytes(extras[..4].try_into().expect("set extras"));
                let exptime =
                    u32::from_be_bytes(extras[4..8].try_into().expect("set extras")) as i64;
                let mode = match base {
                    Opcode::Add => StoreMode::Add,
                    Opcode::Replace => StoreMode::Replace,
                    _ => {
                        if header.cas != 0 {
                            StoreMode::Cas
                        } else {
                            StoreMode::Set
                        }
                    }
                };
                self.begin_store_binary(
                    opcode, mode, key, flags, exptime, value_len, header.cas, opaque, quiet,
                );
            }
            Opcode::Append | Opcode::Prepend => {
                if extlen != 0 || keylen == 0 {
                    self.bin_protocol_error(opcode, opaque, value_len);
                    return;
                }
                let mode = if base == Opcode::Append {
                    StoreMode::Append
                } else {
                    StoreMode::Prepend
                };
                self.begin_store_binary(opcode, mode, key, 0, 0, value_len, header.cas, opaque, quiet);
            }
            Opcode::Stat => {
                if extlen != 0 || value_len != 0 {
                    self.bin_protocol_error(opcode, opaque, value_len);
                    return;
                }
                let arg = if key.is_empty() {
                    None
                } else {
                    Some(String::from_utf8_lossy(&key).into_owned())
                };
                let lines = match arg.as_deref() {
                    None => self.engine.stats_general(self.server.curr_connections()),
                    Some("settings") => self.engine.stats_settings(),
                    Some("items") => self.engine.stats_items(),
                    Some("slabs") => self.engine.stats_slabs(),
                    Some("reset") => {
                        self.engine.stats.reset();
                        Vec::new()
                    }
                    Some(_) => {
                        self.bin_error(opcode, opaque, Status::InvalidArguments);
                        self.finish_reply(false);
                        return;
                    }
                };
                for (name, value) in lines {
                    self.out(binary::response(
                        opcode as u8,
                        Status::NoError,
                        opaque,
                        0,
                        &[],
                        name.as_bytes(),
                        value.as_bytes(),
                    ));
                }
                // Terminator: empty key and value.
                self.out(binary::response(
                    opcode as u8,
                    Status::NoError,
                    opaque,
                    0,
                    &[],
                    &[],
                    &[],
                ));
                self.finish_reply(false);
            }
            _ => {
                self.swallow = value_len;
                self.bin_error(opcode, opaque, Status::UnknownCommand);
                if self.swallow > 0 {
                    let reply = self.resp.pop().expect("queued error");
                    self.swallow_then = Some(reply);
                    self.state = ConnState::Swallow;
                } else {
                    self.finish_reply(false);
                }
            }
        }
    }

    fn bin_get(&mut self, opcode: Opcode, opaque: u32, key: &[u8], touch: Option<u32>) {
        Stats::bump(&self.engine.stats.cmd_get);
        let quiet = opcode.is_quiet();
        let item = match touch {
            Some(exptime) => self.engine.touch(key, exptime),
            None => self.engine.get(key, true),
        };
        match item {
            Some(item) => {
                Stats::bump(&self.engine.stats.get_hits);
                let extras = item.meta.flags.to_be_bytes();
                let value = item.read_value();
                let key_out: &[u8] = if opcode.returns_key() { key } else { &[] };
                self.out(binary::response(
                    opcode as u8,
                    Status::NoError,
                    opaque,
                    item.meta.cas,
                    &extras,
                    key_out,
                    &value,
                ));
                self.ilist.push(item);
                self.finish_reply(false);
            }
            None => {
                Stats::bump(&self.engine.stats.get_misses);
                if quiet {
                    // Quiet gets suppress misses entirely.
                    self.finish_reply(true);
                } else {
                    let key_out: &[u8] = if opcode.returns_key() { key } else { &[] };
                    self.out(binary::response(
                        opcode as u8,
                        Status::KeyNotFound,
                        opaque,
                        0,
                        &[],
                        key_out,
                        if key_out.is_empty() {
                            binary::status_text(Status::KeyNotFound)
                        } else {
                            &[]
                        },
                    ));
                    self.finish_reply(false);
                }
            }
        }
    }

    fn bin_arith(&mut self, opcode: Opcode, incr: bool, opaque: u32, extras: &[u8], key: &[u8]) {
        let delta = u64::from_be_bytes(extras[..8].try_into().expect("arith extras"));
        let initial = u64::from_be_bytes(extras[8..16].try_into().expect("arith extras"));
        let exptime_raw =
            u32::from_be_bytes(extras[16..20].try_into().expect("arith extras"));
        let quiet = opcode.is_quiet();

        let mut outcome = self.engine.add_delta(key, incr, delta);
        if let DeltaOutcome::NotFound = outcome {
            // 0xffffffff means "do not vivify".
            if exptime_raw != u32::MAX {
                let exptime = self.engine.clock().realtime(exptime_raw as i64);
                let text = initial.to_string();
                if let Ok(mut staged) =
                    self.engine
                        .alloc_staged(key, 0, exptime, text.len())
                {
                    staged.write(text.as_bytes());
                    if let StoreOutcome::Stored { cas } = staged.commit(StoreMode::Add, 0) {
                        outcome = DeltaOutcome::Applied {
                            value: initial,
                            cas,
                        };
                    }
                }
            }
        }

        match outcome {
            DeltaOutcome::Applied { value, cas } => {
                let stat = if incr {
                    &self.engine.stats.incr_hits
                } else {
                    &self.engine.stats.decr_hits
                };
                Stats::bump(stat);
                if quiet {
                    self.finish_reply(true);
                } else {
                    self.out(binary::response(
                        opcode as u8,
                        Status::NoError,
                        opaque,
                        cas,
                        &[],
                        &[],
                        &value.to_be_bytes(),
                    ));
                    self.finish_reply(false);
                }
            }
            DeltaOutcome::NotFound => {
                let stat = if incr {
                    &self.engine.stats.incr_misses
                } else {
                    &self.engine.stats.decr_misses
                };
                Stats::bump(stat);
                self.bin_error(opcode, opaque, Status::KeyNotFound);
                self.finish_reply(false);
            }
            DeltaOutcome::NonNumeric => {
                self.bin_error(opcode, opaque, Status::DeltaBadval);
                self.finish_reply(false);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn begin_store_binary(
        &mut self,
        opcode: Opcode,
        mode: StoreMode,
        key: Vec<u8>,
        flags: u32,
        exptime: i64,
        vlen: usize,
        req_cas: u64,
        opaque: u32,
        quiet: bool,
    ) {
        Stats::bump(&self.engine.stats.cmd_set);
        let exptime = self.engine.clock().realtime(exptime);
        let reply = PendingReply::Binary {
            opcode,
            quiet,
            opaque,
        };
        match self.engine.alloc_staged(&key, flags, exptime, vlen) {
            Ok(staged) => {
                self.nread = Some(Nread {
                    staged: Some(staged),
                    mode,
                    req_cas,
                    remaining: vlen,
                    trailer: 0,
                    trailer_seen: [0; 2],
                    reply,
                    fail: None,
                    fail_status: None,
                });
                self.state = ConnState::Nread;
            }
            Err(err) => {
                let status = match err {
                    StoreError::TooLarge => Status::TooLarge,
                    _ => Status::OutOfMemory,
                };
                if mode == StoreMode::Set {
                    self.engine.delete(&key);
                }
                self.nread = Some(Nread {
                    staged: None,
                    mode,
                    req_cas,
                    remaining: vlen,
                    trailer: 0,
                    trailer_seen: [0; 2],
                    reply,
                    fail: Some("binary"),
                    fail_status: Some(status),
                });
                self.state = ConnState::Nread;
            }
        }
    }

    // ── response writing ───────────────────────────────────────────────

    /// Vectored write of the whole segment list, advancing over partials.
    async fn write_segments(&mut self) -> std::io::Result<()> {
        let mut seg = 0usize;
        let mut offset = 0usize;
        while seg < self.resp.len() {
            let mut slices = Vec::with_capacity(self.resp.len() - seg);
            slices.push(IoSlice::new(&self.resp[seg][offset..]));
            for part in &self.resp[seg + 1..] {
                slices.push(IoSlice::new(part));
            }
            let mut written = self.stream.write_vectored(&slices).await?;
            if written == 0 {
                return Err(std::io::ErrorKind::WriteZero.into());
            }
            Stats::add(&self.engine.stats.bytes_written, written as u64);
            while written > 0 && seg < self.resp.len() {
                let left = self.resp[seg].len() - offset;
                if written >= left {
                    written -= left;
                    seg += 1;
                    offset = 0;
                } else {
                    offset += written;
                    written = 0;
                }
            }
        }
        self.stream.flush().await
    }
}
