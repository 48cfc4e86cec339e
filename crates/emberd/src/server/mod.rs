//! Listeners, connection registry, and the idle-connection reaper.

pub mod connection;
pub mod udp;

use crate::store::CacheEngine;
use crate::stats::Stats;
use connection::{ConnShared, Connection};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpSocket, UnixListener};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause before re-checking the connection limit or a failed accept.
const ACCEPT_PAUSE: Duration = Duration::from_millis(10);

/// Connections examined per reaper tick.
const REAPER_SLICE: usize = 100;

/// Shared server state: connection gauges and the registry the reaper scans.
pub struct ServerShared {
    maxconns: usize,
    next_id: AtomicU64,
    curr: AtomicU64,
    conns: Mutex<HashMap<u64, Arc<ConnShared>>>,
}

impl ServerShared {
    pub fn new(maxconns: usize) -> Arc<Self> {
        Arc::new(Self {
            maxconns,
            next_id: AtomicU64::new(1),
            curr: AtomicU64::new(0),
            conns: Mutex::new(HashMap::new()),
        })
    }

    pub fn curr_connections(&self) -> u64 {
        self.curr.load(Ordering::Relaxed)
    }

    fn at_capacity(&self) -> bool {
        self.curr_connections() as usize >= self.maxconns
    }

    /// Register a new connection; returns its id and shared handle.
    fn admit(&self, now: u32) -> (u64, Arc<ConnShared>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let shared = Arc::new(ConnShared {
            last_cmd: AtomicU32::new(now),
            idle_eligible: AtomicBool::new(true),
            kill: CancellationToken::new(),
        });
        self.curr.fetch_add(1, Ordering::Relaxed);
        self.conns.lock().insert(id, Arc::clone(&shared));
        (id, shared)
    }

    /// Drop a closed connection from the registry.
    pub fn forget(&self, id: u64) {
        if self.conns.lock().remove(&id).is_some() {
            self.curr.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

fn spawn_connection<S>(
    stream: S,
    engine: Arc<CacheEngine>,
    shared: Arc<ServerShared>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    Stats::bump(&engine.stats.total_connections);
    let (id, conn_shared) = shared.admit(engine.clock().now());
    debug!(conn = id, "connection accepted");
    let conn = Connection::new(stream, engine, shared, conn_shared, id);
    tokio::spawn(conn.run());
}

/// Bind the TCP listener with the configured backlog.
pub fn bind_tcp(addr: &str, backlog: u32) -> std::io::Result<TcpListener> {
    let addr: std::net::SocketAddr = addr
        .parse()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    socket.listen(backlog)
}

/// Bind the unix-domain listener, replacing a stale socket file.
pub fn bind_unix(path: &str, mask: u32) -> std::io::Result<UnixListener> {
    use std::os::unix::fs::FileTypeExt;
    use std::os::unix::fs::PermissionsExt;

    let path = Path::new(path);
    if let Ok(meta) = std::fs::metadata(path) {
        if meta.file_type().is_socket() {
            std::fs::remove_file(path)?;
        }
    }
    let listener = UnixListener::bind(path)?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(mask))?;
    Ok(listener)
}

/// TCP accept loop: hand every socket to its own connection task, pausing
/// briefly at the connection limit or on accept failure.
pub async fn serve_tcp(
    engine: Arc<CacheEngine>,
    shared: Arc<ServerShared>,
    listener: TcpListener,
    shutdown: CancellationToken,
) {
    loop {
        if shared.at_capacity() {
            tokio::select! {
                _ = tokio::time::sleep(ACCEPT_PAUSE) => continue,
                _ = shutdown.cancelled() => return,
            }
        }
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    if stream.set_nodelay(true).is_err() {
                        continue;
                    }
                    debug!(%peer, "tcp accept");
                    spawn_connection(stream, Arc::clone(&engine), Arc::clone(&shared));
                }
                Err(err) => {
                    // EMFILE and friends: back off and let the reaper or
                    // clients free descriptors.
                    Stats::bump(&engine.stats.rejected_connections);
                    warn!(%err, "accept failed; pausing");
                    tokio::time::sleep(ACCEPT_PAUSE).await;
                }
            },
            _ = shutdown.cancelled() => return,
        }
    }
}

/// Unix-domain accept loop.
pub async fn serve_unix(
    engine: Arc<CacheEngine>,
    shared: Arc<ServerShared>,
    listener: UnixListener,
    shutdown: CancellationToken,
) {
    loop {
        if shared.at_capacity() {
            tokio::select! {
                _ = tokio::time::sleep(ACCEPT_PAUSE) => continue,
                _ = shutdown.cancelled() => return,
            }
        }
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    spawn_connection(stream, Arc::clone(&engine), Arc::clone(&shared));
                }
                Err(err) => {
                    Stats::bump(&engine.stats.rejected_connections);
                    warn!(%err, "unix accept failed; pausing");
                    tokio::time::sleep(ACCEPT_PAUSE).await;
                }
            },
            _ = shutdown.cancelled() => return,
        }
    }
}

/// Idle-connection reaper: walks the registry in bounded slices and kicks
/// connections idle past `idle_timeout`.
pub async fn reaper_task(
    engine: Arc<CacheEngine>,
    shared: Arc<ServerShared>,
    shutdown: CancellationToken,
) {
    let timeout = engine.settings().idle_timeout;
    if timeout == 0 {
        return;
    }
    info!(timeout, "idle-connection reaper running");
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    let mut resume_after: u64 = 0;
    loop {
        tokio::select! {
            _ = tick.tick() => {}
            _ = shutdown.cancelled() => return,
        }
        let now = engine.clock().now();
        let slice: Vec<(u64, Arc<ConnShared>)> = {
            let conns = shared.conns.lock();
            let mut ids: Vec<u64> = conns.keys().copied().collect();
            ids.sort_unstable();
            ids.iter()
                .copied()
                .filter(|&id| id > resume_after)
                .take(REAPER_SLICE)
                .map(|id| (id, Arc::clone(&conns[&id])))
                .collect()
        };
        resume_after = slice.last().map(|(id, _)| *id).unwrap_or(0);
        for (id, conn) in slice {
            if !conn.idle_eligible.load(Ordering::Relaxed) {
                continue;
            }
            let last = conn.last_cmd.load(Ordering::Relaxed);
            if now.saturating_sub(last) > timeout {
                debug!(conn = id, idle = now - last, "reaping idle connection");
                conn.kill.cancel();
            }
        }
    }
}
