//! Process-wide relative clock.
//!
//! All item timestamps are seconds since server start, refreshed once per
//! second by a background task. This keeps timestamps at 32 bits and makes
//! them immune to wall-clock jumps.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Expiry values above this are absolute unix timestamps (30 days).
pub const REALTIME_MAXDELTA: i64 = 60 * 60 * 24 * 30;

/// Shared handle to the relative-seconds clock.
#[derive(Debug, Clone)]
pub struct Clock {
    inner: Arc<ClockInner>,
}

#[derive(Debug)]
struct ClockInner {
    current: AtomicU32,
    started: Instant,
    /// Unix timestamp of process start, for absolute expiry conversion.
    epoch_start: i64,
}

impl Clock {
    pub fn new() -> Self {
        let epoch_start = chrono::Utc::now().timestamp();
        Self {
            inner: Arc::new(ClockInner {
                // Start at 1 so 0 stays reserved for "never".
                current: AtomicU32::new(1),
                started: Instant::now(),
                epoch_start,
            }),
        }
    }

    /// Current relative time in seconds since start.
    #[inline]
    pub fn now(&self) -> u32 {
        self.inner.current.load(Ordering::Relaxed)
    }

    /// Unix timestamp of process start.
    pub fn epoch_start(&self) -> i64 {
        self.inner.epoch_start
    }

    /// Refresh the tick from the monotonic clock.
    pub fn update(&self) {
        let elapsed = self.inner.started.elapsed().as_secs() as u32;
        self.inner.current.store(elapsed + 1, Ordering::Relaxed);
    }

    /// Force the tick for tests.
    #[cfg(test)]
    pub fn set(&self, value: u32) {
        self.inner.current.store(value, Ordering::Relaxed);
    }

    /// Convert a client-supplied expiry into relative seconds.
    ///
    /// 0 means never. Values above [`REALTIME_MAXDELTA`] are absolute unix
    /// timestamps; anything already in the past collapses to 1 (expired on
    /// the next lookup). Negative values expire immediately.
    pub fn realtime(&self, exptime: i64) -> u32 {
        if exptime == 0 {
            return 0;
        }
        if exptime < 0 {
            return 1;
        }
        if exptime > REALTIME_MAXDELTA {
            let rel = exptime - self.inner.epoch_start;
            if rel <= 0 {
                1
            } else {
                rel.min(u32::MAX as i64) as u32
            }
        } else {
            self.now().saturating_add(exptime as u32)
        }
    }

    /// Spawn the 1 Hz updater task.
    pub fn spawn_updater(&self, shutdown: CancellationToken) -> tokio::task::JoinHandle<()> {
        let clock = self.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = tick.tick() => clock.update(),
                    _ = shutdown.cancelled() => break,
                }
            }
        })
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_means_never() {
        let clock = Clock::new();
        assert_eq!(clock.realtime(0), 0);
    }

    #[test]
    fn test_relative_expiry_offsets_now() {
        let clock = Clock::new();
        clock.set(100);
        assert_eq!(clock.realtime(60), 160);
    }

    #[test]
    fn test_negative_expires_immediately() {
        let clock = Clock::new();
        clock.set(100);
        assert_eq!(clock.realtime(-1), 1);
    }

    #[test]
    fn test_absolute_timestamp_converts() {
        let clock = Clock::new();
        let future = clock.epoch_start() + 5000;
        assert_eq!(clock.realtime(future), 5000);
        // An absolute timestamp in the past is already expired.
        assert_eq!(clock.realtime(clock.epoch_start() - 10), 1);
    }
}
