//! UDP transport: framed single-datagram requests.
//!
//! Each datagram carries an 8-byte frame header (request id, sequence,
//! datagram count, reserved) ahead of the payload. Requests spanning
//! multiple datagrams are dropped; oversized responses are fragmented into
//! sequence-numbered frames echoing the request id.

use crate::proto::{ascii, Command};
use crate::stats::Stats;
use crate::store::{CacheEngine, DeltaOutcome, StoreOutcome};
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Frame header length.
const FRAME_HEADER: usize = 8;

/// Payload budget per response datagram.
const FRAME_PAYLOAD: usize = 1400 - FRAME_HEADER;

/// Largest request datagram accepted.
const MAX_DATAGRAM: usize = 64 * 1024;

fn frame_header(request_id: u16, seq: u16, total: u16) -> [u8; FRAME_HEADER] {
    let mut header = [0u8; FRAME_HEADER];
    header[..2].copy_from_slice(&request_id.to_be_bytes());
    header[2..4].copy_from_slice(&seq.to_be_bytes());
    header[4..6].copy_from_slice(&total.to_be_bytes());
    header
}

/// Serve one UDP socket until shutdown.
pub async fn serve_udp(
    engine: Arc<CacheEngine>,
    socket: UdpSocket,
    shutdown: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, peer) = tokio::select! {
            received = socket.recv_from(&mut buf) => match received {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(%err, "udp receive failed");
                    continue;
                }
            },
            _ = shutdown.cancelled() => return,
        };
        if len < FRAME_HEADER {
            continue;
        }
        Stats::add(&engine.stats.bytes_read, len as u64);
        let request_id = u16::from_be_bytes([buf[0], buf[1]]);
        let seq = u16::from_be_bytes([buf[2], buf[3]]);
        let total = u16::from_be_bytes([buf[4], buf[5]]);
        if seq != 0 || total != 1 {
            // Multi-datagram requests are not reassembled.
            debug!(%peer, seq, total, "dropping multi-datagram udp request");
            continue;
        }
        let payload = &buf[FRAME_HEADER..len];
        if payload.first() == Some(&crate::proto::binary::MAGIC_REQUEST) {
            // Binary over UDP is not served; the datagram is dropped.
            debug!(%peer, "dropping binary udp request");
            continue;
        }
        let reply = handle_payload(&engine, payload);
        if reply.is_empty() {
            continue;
        }

        // Fragment the response; each frame repeats the request id.
        let frames = reply.chunks(FRAME_PAYLOAD).collect::<Vec<_>>();
        let count = frames.len() as u16;
        for (idx, frame) in frames.into_iter().enumerate() {
            let mut packet = Vec::with_capacity(FRAME_HEADER + frame.len());
            packet.extend_from_slice(&frame_header(request_id, idx as u16, count));
            packet.extend_from_slice(frame);
            match socket.send_to(&packet, peer).await {
                Ok(sent) => Stats::add(&engine.stats.bytes_written, sent as u64),
                Err(err) => {
                    warn!(%err, %peer, "udp send failed");
                    break;
                }
            }
        }
    }
}

/// Run every complete ASCII command in the datagram; bodies must be inline.
fn handle_payload(engine: &Arc<CacheEngine>, mut payload: &[u8]) -> Vec<u8> {
    let mut reply = Vec::new();
    while !payload.is_empty() {
        match ascii::parse(payload) {
            ascii::ParseResult::Incomplete | ascii::ParseResult::Broken => break,
            ascii::ParseResult::Line { consumed, parsed } => {
                payload = &payload[consumed..];
                match parsed {
                    ascii::Parsed::Unknown => reply.extend_from_slice(b"ERROR\r\n"),
                    ascii::Parsed::ClientError(msg) => {
                        reply.extend_from_slice(format!("CLIENT_ERROR {msg}\r\n").as_bytes())
                    }
                    ascii::Parsed::Cmd(cmd) => {
                        let done = run_command(engine, cmd, &mut payload, &mut reply);
                        if done {
                            break;
                        }
                    }
                }
            }
        }
    }
    reply
}

/// Execute one datagram command. Returns true when processing must stop.
fn run_command(
    engine: &Arc<CacheEngine>,
    cmd: Command,
    payload: &mut &[u8],
    reply: &mut Vec<u8>,
) -> bool {
    match cmd {
        Command::Get {
            keys,
            with_cas,
            touch,
        } => {
            let exptime = touch.map(|t| engine.clock().realtime(t));
            for key in keys {
                Stats::bump(&engine.stats.cmd_get);
                let item = match exptime {
                    Some(exptime) => engine.touch(&key, exptime),
                    None => engine.get(&key, true),
                };
                match item {
                    Some(item) => {
                        Stats::bump(&engine.stats.get_hits);
                        let cas = with_cas.then_some(item.meta.cas);
                        reply.extend_from_slice(&ascii::value_header(
                            &key,
                            item.meta.flags,
                            item.meta.nbytes,
                            cas,
                        ));
                        reply.extend_from_slice(&item.read_value());
                        reply.extend_from_slice(b"\r\n");
                    }
                    None => Stats::bump(&engine.stats.get_misses),
                }
            }
            reply.extend_from_slice(b"END\r\n");
            false
        }
        Command::Store {
            mode,
            key,
            flags,
            exptime,
            vlen,
            req_cas,
            noreply,
        } => {
            Stats::bump(&engine.stats.cmd_set);
            // The body plus CRLF must sit inside the datagram.
            if payload.len() < vlen + 2 || &payload[vlen..vlen + 2] != b"\r\n" {
                if !noreply {
                    reply.extend_from_slice(b"CLIENT_ERROR bad data chunk\r\n");
                }
                return true;
            }
            let body = &payload[..vlen];
            let exptime = engine.clock().realtime(exptime);
            let outcome = match engine.alloc_staged(&key, flags, exptime, vlen) {
                Ok(mut staged) => {
                    staged.write(body);
                    Some(staged.commit(mode, req_cas))
                }
                Err(_) => None,
            };
            *payload = &payload[vlen + 2..];
            if !noreply {
                let text: &[u8] = match outcome {
                    Some(StoreOutcome::Stored { .. }) => b"STORED\r\n",
                    Some(StoreOutcome::NotStored) => b"NOT_STORED\r\n",
                    Some(StoreOutcome::Exists) => b"EXISTS\r\n",
                    Some(StoreOutcome::NotFound) => b"NOT_FOUND\r\n",
                    None => b"SERVER_ERROR out of memory storing object\r\n",
                };
                reply.extend_from_slice(text);
            }
            false
        }
        Command::Delete { key, noreply } => {
            let hit = engine.delete(&key);
            Stats::bump(if hit {
                &engine.stats.delete_hits
            } else {
                &engine.stats.delete_misses
            });
            if !noreply {
                reply.extend_from_slice(if hit { b"DELETED\r\n" } else { b"NOT_FOUND\r\n" });
            }
            false
        }
        Command::Arith {
            key,
            incr,
            delta,
            noreply,
        } => {
            let outcome = engine.add_delta(&key, incr, delta);
            if !noreply {
                match outcome {
                    DeltaOutcome::Applied { value, .. } => {
                        reply.extend_from_slice(format!("{value}\r\n").as_bytes())
                    }
                    DeltaOutcome::NotFound => reply.extend_from_slice(b"NOT_FOUND\r\n"),
                    DeltaOutcome::NonNumeric => reply.extend_from_slice(
                        b"CLIENT_ERROR cannot increment or decrement non-numeric value\r\n",
                    ),
                }
            }
            false
        }
        Command::Touch {
            key,
            exptime,
            noreply,
        } => {
            Stats::bump(&engine.stats.cmd_touch);
            let exptime = engine.clock().realtime(exptime);
            let hit = engine.touch(&key, exptime).is_some();
            Stats::bump(if hit {
                &engine.stats.touch_hits
            } else {
                &engine.stats.touch_misses
            });
            if !noreply {
                reply.extend_from_slice(if hit { b"TOUCHED\r\n" } else { b"NOT_FOUND\r\n" });
            }
            false
        }
        Command::Version => {
            reply.extend_from_slice(
                format!("VERSION {}\r\n", env!("CARGO_PKG_VERSION")).as_bytes(),
            );
            false
        }
        // Admin and stateful commands are TCP-only.
        _ => {
            reply.extend_from_slice(b"ERROR\r\n");
            false
        }
    }
}
