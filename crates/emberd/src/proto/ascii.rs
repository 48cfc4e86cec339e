//! ASCII protocol: newline-terminated commands, space-separated tokens.

use super::{Command, CrawlTargets, CrawlerCmd, SlabsCmd};
use crate::store::item::KEY_MAX_LENGTH;
use crate::store::StoreMode;

/// Commands longer than this without a newline close the connection unless
/// they are a multiget.
const LINE_SNIFF_LIMIT: usize = 1024;

/// Hard cap on keys in one multiget line.
pub const MAX_GET_KEYS: usize = 1024;

/// Outcome of scanning the read buffer for one command line.
#[derive(Debug)]
pub enum ParseResult {
    /// No complete line yet.
    Incomplete,
    /// Oversized garbage line; the stream cannot be re-framed.
    Broken,
    /// One line consumed.
    Line { consumed: usize, parsed: Parsed },
}

/// A consumed line: either a command or an immediate error reply.
#[derive(Debug)]
pub enum Parsed {
    Cmd(Command),
    /// Unknown verb: plain `ERROR`.
    Unknown,
    /// Malformed arguments.
    ClientError(&'static str),
}

const BAD_FORMAT: &str = "bad command line format";

/// Scan for one `\n`-terminated command line and parse it.
pub fn parse(buf: &[u8]) -> ParseResult {
    let Some(nl) = buf.iter().position(|&b| b == b'\n') else {
        if buf.len() > LINE_SNIFF_LIMIT {
            // Only a large multiget may legitimately run this long.
            let head = &buf[..buf.len().min(LINE_SNIFF_LIMIT)];
            let trimmed = strip_leading_spaces(head);
            if head.len() - trimmed.len() > 100
                || !(trimmed.starts_with(b"get ") || trimmed.starts_with(b"gets "))
            {
                return ParseResult::Broken;
            }
        }
        return ParseResult::Incomplete;
    };

    let consumed = nl + 1;
    let mut line = &buf[..nl];
    if line.last() == Some(&b'\r') {
        line = &line[..line.len() - 1];
    }
    ParseResult::Line {
        consumed,
        parsed: parse_line(line),
    }
}

fn strip_leading_spaces(buf: &[u8]) -> &[u8] {
    let mut idx = 0;
    while idx < buf.len() && buf[idx] == b' ' {
        idx += 1;
    }
    &buf[idx..]
}

fn parse_line(line: &[u8]) -> Parsed {
    let tokens: Vec<&[u8]> = line.split(|&b| b == b' ').filter(|t| !t.is_empty()).collect();
    let Some(&verb) = tokens.first() else {
        return Parsed::Unknown;
    };

    match verb {
        b"get" => parse_get(&tokens, false, false),
        b"gets" => parse_get(&tokens, true, false),
        b"gat" => parse_get(&tokens, false, true),
        b"gats" => parse_get(&tokens, true, true),
        b"set" => parse_store(&tokens, StoreMode::Set),
        b"add" => parse_store(&tokens, StoreMode::Add),
        b"replace" => parse_store(&tokens, StoreMode::Replace),
        b"append" => parse_store(&tokens, StoreMode::Append),
        b"prepend" => parse_store(&tokens, StoreMode::Prepend),
        b"cas" => parse_store(&tokens, StoreMode::Cas),
        b"delete" => parse_delete(&tokens),
        b"incr" => parse_arith(&tokens, true),
        b"decr" => parse_arith(&tokens, false),
        b"touch" => parse_touch(&tokens),
        b"flush_all" => parse_flush(&tokens),
        b"stats" => {
            let arg = tokens
                .get(1)
                .map(|t| String::from_utf8_lossy(t).into_owned());
            Parsed::Cmd(Command::Stats { arg })
        }
        b"version" => Parsed::Cmd(Command::Version),
        b"verbosity" => parse_verbosity(&tokens),
        b"quit" => Parsed::Cmd(Command::Quit),
        b"slabs" => parse_slabs(&tokens),
        b"lru_crawler" => parse_crawler(&tokens),
        _ => Parsed::Unknown,
    }
}

fn noreply_maybe(tokens: &[&[u8]]) -> bool {
    tokens.last() == Some(&&b"noreply"[..])
}

fn parse_u32(token: &[u8]) -> Option<u32> {
    std::str::from_utf8(token).ok()?.parse().ok()
}

fn parse_u64(token: &[u8]) -> Option<u64> {
    std::str::from_utf8(token).ok()?.parse().ok()
}

fn parse_i64(token: &[u8]) -> Option<i64> {
    std::str::from_utf8(token).ok()?.parse().ok()
}

fn key_ok(key: &[u8]) -> bool {
    !key.is_empty() && key.len() <= KEY_MAX_LENGTH
}

fn parse_get(tokens: &[&[u8]], with_cas: bool, touch: bool) -> Parsed {
    let mut key_start = 1;
    let mut exptime = None;
    if touch {
        let Some(value) = tokens.get(1).and_then(|t| parse_i64(t)) else {
            return Parsed::ClientError("invalid exptime argument");
        };
        exptime = Some(value);
        key_start = 2;
    }
    if tokens.len() <= key_start {
        return Parsed::ClientError(BAD_FORMAT);
    }
    let keys: Vec<Vec<u8>> = tokens[key_start..]
        .iter()
        .take(MAX_GET_KEYS)
        .map(|t| t.to_vec())
        .collect();
    if keys.iter().any(|k| !key_ok(k)) {
        return Parsed::ClientError(BAD_FORMAT);
    }
    Parsed::Cmd(Command::Get {
        keys,
        with_cas,
        touch: exptime,
    })
}

fn parse_store(tokens: &[&[u8]], mode: StoreMode) -> Parsed {
    let noreply = noreply_maybe(tokens);
    let expected = match mode {
        StoreMode::Cas => 6,
        _ => 5,
    } + noreply as usize;
    if tokens.len() != expected {
        return Parsed::ClientError(BAD_FORMAT);
    }
    let key = tokens[1];
    if !key_ok(key) {
        return Parsed::ClientError(BAD_FORMAT);
    }
    let (Some(flags), Some(exptime), Some(vlen)) = (
        parse_u32(tokens[2]),
        parse_i64(tokens[3]),
        parse_i64(tokens[4]),
    ) else {
        return Parsed::ClientError(BAD_FORMAT);
    };
    if vlen < 0 || vlen > i32::MAX as i64 - 2 {
        return Parsed::ClientError(BAD_FORMAT);
    }
    let req_cas = if mode == StoreMode::Cas {
        match parse_u64(tokens[5]) {
            Some(cas) => cas,
            None => return Parsed::ClientError(BAD_FORMAT),
        }
    } else {
        0
    };
    Parsed::Cmd(Command::Store {
        mode,
        key: key.to_vec(),
        flags,
        exptime,
        vlen: vlen as usize,
        req_cas,
        noreply,
    })
}

fn parse_delete(tokens: &[&[u8]]) -> Parsed {
    let noreply = noreply_maybe(tokens);
    // Accept the legacy `delete <key> 0` form.
    let max = 2 + noreply as usize + 1;
    if tokens.len() < 2 || tokens.len() > max {
        return Parsed::ClientError("bad command line format.  Usage: delete <key> [noreply]");
    }
    if tokens.len() == max && tokens[2] != b"0" && !(noreply && tokens[2] == b"noreply") {
        return Parsed::ClientError("bad command line format.  Usage: delete <key> [noreply]");
    }
    let key = tokens[1];
    if !key_ok(key) {
        return Parsed::ClientError(BAD_FORMAT);
    }
    Parsed::Cmd(Command::Delete {
        key: key.to_vec(),
        noreply,
    })
}

fn parse_arith(tokens: &[&[u8]], incr: bool) -> Parsed {
    let noreply = noreply_maybe(tokens);
    if tokens.len() != 3 + noreply as usize {
        return Parsed::ClientError(BAD_FORMAT);
    }
    let key = tokens[1];
    if !key_ok(key) {
        return Parsed::ClientError(BAD_FORMAT);
    }
    let Some(delta) = parse_u64(tokens[2]) else {
        return Parsed::ClientError("invalid numeric delta argument");
    };
    Parsed::Cmd(Command::Arith {
        key: key.to_vec(),
        incr,
        delta,
        noreply,
    })
}

fn parse_touch(tokens: &[&[u8]]) -> Parsed {
    let noreply = noreply_maybe(tokens);
    if tokens.len() != 3 + noreply as usize {
        return Parsed::ClientError(BAD_FORMAT);
    }
    let key = tokens[1];
    if !key_ok(key) {
        return Parsed::ClientError(BAD_FORMAT);
    }
    let Some(exptime) = parse_i64(tokens[2]) else {
        return Parsed::ClientError("invalid exptime argument");
    };
    Parsed::Cmd(Command::Touch {
        key: key.to_vec(),
        exptime,
        noreply,
    })
}

fn parse_flush(tokens: &[&[u8]]) -> Parsed {
    let noreply = noreply_maybe(tokens);
    let args = tokens.len() - 1 - noreply as usize;
    let delay = match args {
        0 => 0,
        1 => match parse_i64(tokens[1]) {
            Some(delay) => delay,
            None => return Parsed::ClientError(BAD_FORMAT),
        },
        _ => return Parsed::ClientError(BAD_FORMAT),
    };
    Parsed::Cmd(Command::FlushAll { delay, noreply })
}

fn parse_verbosity(tokens: &[&[u8]]) -> Parsed {
    let noreply = noreply_maybe(tokens);
    if tokens.len() != 2 + noreply as usize {
        return Parsed::ClientError(BAD_FORMAT);
    }
    let Some(level) = parse_u32(tokens[1]) else {
        return Parsed::ClientError(BAD_FORMAT);
    };
    Parsed::Cmd(Command::Verbosity { level, noreply })
}

fn parse_slabs(tokens: &[&[u8]]) -> Parsed {
    match tokens.get(1) {
        Some(&b"reassign") => {
            let (Some(src), Some(dst)) = (
                tokens.get(2).and_then(|t| parse_u32(t)),
                tokens.get(3).and_then(|t| parse_u32(t)),
            ) else {
                return Parsed::ClientError(BAD_FORMAT);
            };
            if tokens.len() != 4 || src > u8::MAX as u32 || dst > u8::MAX as u32 {
                return Parsed::ClientError(BAD_FORMAT);
            }
            Parsed::Cmd(Command::Slabs(SlabsCmd::Reassign {
                src: src as u8,
                dst: dst as u8,
            }))
        }
        Some(&b"automove") => {
            let Some(level) = tokens.get(2).and_then(|t| parse_u32(t)) else {
                return Parsed::ClientError(BAD_FORMAT);
            };
            if tokens.len() != 3 || level > 2 {
                return Parsed::ClientError(BAD_FORMAT);
            }
            Parsed::Cmd(Command::Slabs(SlabsCmd::Automove {
                level: level as u8,
            }))
        }
        _ => Parsed::ClientError(BAD_FORMAT),
    }
}

fn parse_class_list(token: &[u8]) -> Option<CrawlTargets> {
    if token == b"all" {
        return Some(CrawlTargets::All);
    }
    let mut classes = Vec::new();
    for part in token.split(|&b| b == b',') {
        let cls: u32 = std::str::from_utf8(part).ok()?.parse().ok()?;
        if cls == 0 || cls > u8::MAX as u32 {
            return None;
        }
        classes.push(cls as u8);
    }
    if classes.is_empty() {
        None
    } else {
        Some(CrawlTargets::Classes(classes))
    }
}

fn parse_crawler(tokens: &[&[u8]]) -> Parsed {
    let cmd = match tokens.get(1) {
        Some(&b"enable") => CrawlerCmd::Enable,
        Some(&b"disable") => CrawlerCmd::Disable,
        Some(&b"crawl") => match tokens.get(2).and_then(|t| parse_class_list(t)) {
            Some(targets) => CrawlerCmd::Crawl(targets),
            None => return Parsed::ClientError(BAD_FORMAT),
        },
        Some(&b"metadump") => match tokens.get(2).and_then(|t| parse_class_list(t)) {
            Some(targets) => CrawlerCmd::Metadump(targets),
            None => return Parsed::ClientError(BAD_FORMAT),
        },
        Some(&b"sleep") => match tokens.get(2).and_then(|t| parse_u32(t)) {
            Some(us) if us <= 1_000_000 => CrawlerCmd::Sleep(us),
            _ => return Parsed::ClientError("sleep must be between 0 and 1000000"),
        },
        Some(&b"tocrawl") => match tokens.get(2).and_then(|t| parse_u64(t)) {
            Some(count) => CrawlerCmd::Tocrawl(count),
            None => return Parsed::ClientError(BAD_FORMAT),
        },
        _ => return Parsed::ClientError(BAD_FORMAT),
    };
    Parsed::Cmd(Command::LruCrawler(cmd))
}

// ── response rendering ──────────────────────────────────────────────────

/// `VALUE <key> <flags> <bytes>[ <cas>]\r\n` header for one hit.
pub fn value_header(key: &[u8], flags: u32, nbytes: u32, cas: Option<u64>) -> Vec<u8> {
    let mut out = Vec::with_capacity(key.len() + 32);
    out.extend_from_slice(b"VALUE ");
    out.extend_from_slice(key);
    match cas {
        Some(cas) => out.extend_from_slice(format!(" {flags} {nbytes} {cas}\r\n").as_bytes()),
        None => out.extend_from_slice(format!(" {flags} {nbytes}\r\n").as_bytes()),
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_one(line: &[u8]) -> Parsed {
        match parse(line) {
            ParseResult::Line { parsed, consumed } => {
                assert_eq!(consumed, line.len());
                parsed
            }
            other => panic!("expected parsed line, got {other:?}"),
        }
    }

    #[test]
    fn test_set_line() {
        let parsed = parse_one(b"set foo 7 0 3\r\n");
        let Parsed::Cmd(Command::Store {
            mode,
            key,
            flags,
            exptime,
            vlen,
            noreply,
            ..
        }) = parsed
        else {
            panic!("not a store command");
        };
        assert_eq!(mode, StoreMode::Set);
        assert_eq!(key, b"foo");
        assert_eq!(flags, 7);
        assert_eq!(exptime, 0);
        assert_eq!(vlen, 3);
        assert!(!noreply);
    }

    #[test]
    fn test_cas_requires_id() {
        assert!(matches!(
            parse_one(b"cas foo 0 0 3\r\n"),
            Parsed::ClientError(_)
        ));
        let Parsed::Cmd(Command::Store { mode, req_cas, .. }) =
            parse_one(b"cas foo 0 0 3 42\r\n")
        else {
            panic!("not a store command");
        };
        assert_eq!(mode, StoreMode::Cas);
        assert_eq!(req_cas, 42);
    }

    #[test]
    fn test_multiget() {
        let Parsed::Cmd(Command::Get {
            keys,
            with_cas,
            touch,
        }) = parse_one(b"gets a b c\r\n")
        else {
            panic!("not a get");
        };
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
        assert!(with_cas);
        assert!(touch.is_none());
    }

    #[test]
    fn test_gat_takes_exptime_first() {
        let Parsed::Cmd(Command::Get { keys, touch, .. }) = parse_one(b"gat 60 k1 k2\r\n") else {
            panic!("not a gat");
        };
        assert_eq!(touch, Some(60));
        assert_eq!(keys.len(), 2);
    }

    #[test]
    fn test_noreply_suffix() {
        let Parsed::Cmd(Command::Delete { noreply, .. }) = parse_one(b"delete k noreply\r\n")
        else {
            panic!("not a delete");
        };
        assert!(noreply);
    }

    #[test]
    fn test_unknown_verb_is_error() {
        assert!(matches!(parse_one(b"frobnicate\r\n"), Parsed::Unknown));
    }

    #[test]
    fn test_oversized_key_rejected() {
        let big = vec![b'x'; KEY_MAX_LENGTH + 1];
        let mut line = b"get ".to_vec();
        line.extend_from_slice(&big);
        line.extend_from_slice(b"\r\n");
        assert!(matches!(parse_one(&line), Parsed::ClientError(_)));

        let exact = vec![b'y'; KEY_MAX_LENGTH];
        let mut line = b"get ".to_vec();
        line.extend_from_slice(&exact);
        line.extend_from_slice(b"\r\n");
        assert!(matches!(parse_one(&line), Parsed::Cmd(Command::Get { .. })));
    }

    #[test]
    fn test_incomplete_line() {
        assert!(matches!(parse(b"get foo"), ParseResult::Incomplete));
    }

    #[test]
    fn test_giant_non_get_line_breaks_stream() {
        let mut buf = b"set ".to_vec();
        buf.extend_from_slice(&vec![b'a'; 2000]);
        assert!(matches!(parse(&buf), ParseResult::Broken));

        // A long multiget keeps waiting instead.
        let mut buf = b"get ".to_vec();
        buf.extend_from_slice(&vec![b'a'; 2000]);
        assert!(matches!(parse(&buf), ParseResult::Incomplete));
    }

    #[test]
    fn test_crawler_commands() {
        assert!(matches!(
            parse_one(b"lru_crawler crawl 1,2,3\r\n"),
            Parsed::Cmd(Command::LruCrawler(CrawlerCmd::Crawl(CrawlTargets::Classes(ref c))))
                if c == &vec![1, 2, 3]
        ));
        assert!(matches!(
            parse_one(b"lru_crawler metadump all\r\n"),
            Parsed::Cmd(Command::LruCrawler(CrawlerCmd::Metadump(CrawlTargets::All)))
        ));
    }

    #[test]
    fn test_value_header_shapes() {
        assert_eq!(value_header(b"k", 0, 3, None), b"VALUE k 0 3\r\n".to_vec());
        assert_eq!(
            value_header(b"k", 5, 3, Some(9)),
            b"VALUE k 5 3 9\r\n".to_vec()
        );
    }
}
