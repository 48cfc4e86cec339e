//! Ember cache daemon (emberd)
//!
//! Standalone service that:
//! - Serves the memcached ASCII and binary protocols over TCP, UDP, and
//!   unix-domain sockets
//! - Bounds memory with a slab allocator and segmented LRU eviction
//! - Runs background maintenance (LRU maintainer, crawler, slab rebalancer,
//!   hash expander, idle reaper)
//!
//! Default bind: 0.0.0.0:11211

use anyhow::{Context, Result};
use emberd::clock::Clock;
use emberd::config::Settings;
use emberd::maintainer;
use emberd::server::{self, ServerShared};
use emberd::slab::rebalance;
use emberd::store::{crawler, CacheEngine};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> Result<()> {
    // Initialize tracing with structured fields
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,emberd=debug")),
        )
        .init();

    let settings = Arc::new(Settings::load().context("invalid configuration")?);

    info!("Starting Ember cache daemon (emberd)");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        maxbytes = settings.maxbytes,
        threads = settings.num_threads,
        "memory budget configured"
    );

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(settings.num_threads)
        .enable_all()
        .build()
        .context("cannot build runtime")?;
    runtime.block_on(run(settings))
}

async fn run(settings: Arc<Settings>) -> Result<()> {
    let clock = Clock::new();
    let engine = CacheEngine::new(Arc::clone(&settings), clock.clone());
    let shared = ServerShared::new(settings.maxconns);
    let shutdown = CancellationToken::new();

    let _clock_task = clock.spawn_updater(shutdown.clone());

    // Listeners
    if !settings.tcp_addr.is_empty() {
        let listener = server::bind_tcp(&settings.tcp_addr, settings.backlog)
            .with_context(|| format!("cannot bind tcp {}", settings.tcp_addr))?;
        info!("emberd listening on tcp {}", settings.tcp_addr);
        tokio::spawn(server::serve_tcp(
            Arc::clone(&engine),
            Arc::clone(&shared),
            listener,
            shutdown.clone(),
        ));
    }
    if !settings.udp_addr.is_empty() {
        let socket = tokio::net::UdpSocket::bind(&settings.udp_addr)
            .await
            .with_context(|| format!("cannot bind udp {}", settings.udp_addr))?;
        info!("emberd listening on udp {}", settings.udp_addr);
        tokio::spawn(server::udp::serve_udp(
            Arc::clone(&engine),
            socket,
            shutdown.clone(),
        ));
    }
    if !settings.unix_path.is_empty() {
        let listener = server::bind_unix(&settings.unix_path, settings.unix_mask)
            .with_context(|| format!("cannot bind unix socket {}", settings.unix_path))?;
        info!("emberd listening on unix {}", settings.unix_path);
        tokio::spawn(server::serve_unix(
            Arc::clone(&engine),
            Arc::clone(&shared),
            listener,
            shutdown.clone(),
        ));
    }

    // Background maintenance
    if settings.lru_maintainer_thread {
        tokio::spawn(maintainer::lru_maintainer_task(
            Arc::clone(&engine),
            shutdown.clone(),
        ));
    }
    tokio::spawn(maintainer::hash_expander_task(
        Arc::clone(&engine),
        shutdown.clone(),
    ));
    tokio::spawn(crawler::crawler_task(Arc::clone(&engine), shutdown.clone()));
    if settings.slab_reassign {
        tokio::spawn(rebalance::rebalancer_task(
            Arc::clone(&engine),
            shutdown.clone(),
        ));
        tokio::spawn(rebalance::automover_task(
            Arc::clone(&engine),
            shutdown.clone(),
        ));
    }
    tokio::spawn(server::reaper_task(
        Arc::clone(&engine),
        Arc::clone(&shared),
        shutdown.clone(),
    ));

    wait_for_signal().await;
    info!("shutdown signal received; stopping");
    shutdown.cancel();
    // Give background tasks a moment to observe the token.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    info!("emberd stopped");
    Ok(())
}

async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            warn!(%err, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}
