//! Brute-force rate limiting for edge registration.
//!
//! Keyed by remote IP, host part only. After `THRESHOLD` failed attempts
//! the address is blocked for `BLOCK_WINDOW`; a successful auth clears the
//! record. Records idle past `RETENTION` are swept hourly.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::debug;

/// Failed attempts before an address is blocked.
const THRESHOLD: u32 = 5;
/// How long a tripped address stays blocked.
const BLOCK_WINDOW: Duration = Duration::from_secs(15 * 60);
/// Records idle longer than this are garbage collected.
const RETENTION: Duration = Duration::from_secs(24 * 60 * 60);
/// Sweep interval for the GC task.
const GC_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug)]
struct FailedAttempts {
    count: u32,
    last_attempt_at: Instant,
    blocked_until: Option<Instant>,
}

pub struct RateLimiter {
    attempts: Mutex<HashMap<IpAddr, FailedAttempts>>,
    threshold: u32,
    block_window: Duration,
    retention: Duration,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::with_limits(THRESHOLD, BLOCK_WINDOW, RETENTION)
    }

    pub fn with_limits(threshold: u32, block_window: Duration, retention: Duration) -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
            threshold,
            block_window,
            retention,
        }
    }

    /// True while the address is inside its block window.
    pub fn is_blocked(&self, addr: IpAddr) -> bool {
        let attempts = self.attempts.lock();
        match attempts.get(&addr).and_then(|a| a.blocked_until) {
            Some(until) => Instant::now() < until,
            None => false,
        }
    }

    /// Record a failed auth attempt.
    ///
    /// At the threshold the block window is set; further failures past the
    /// threshold re-apply the same window, they do not extend it.
    pub fn record_failure(&self, addr: IpAddr) {
        let now = Instant::now();
        let mut attempts = self.attempts.lock();
        let entry = attempts.entry(addr).or_insert(FailedAttempts {
            count: 0,
            last_attempt_at: now,
            blocked_until: None,
        });
        entry.count += 1;
        entry.last_attempt_at = now;
        if entry.count >= self.threshold {
            entry.blocked_until = Some(now + self.block_window);
        }
    }

    /// Forget an address after a successful auth.
    pub fn clear(&self, addr: IpAddr) {
        self.attempts.lock().remove(&addr);
    }

    /// Drop records idle past the retention window.
    pub fn sweep(&self) {
        let now = Instant::now();
        let removed = {
            let mut attempts = self.attempts.lock();
            let before = attempts.len();
            attempts.retain(|_, a| now.duration_since(a.last_attempt_at) <= self.retention);
            before - attempts.len()
        };
        if removed > 0 {
            debug!(removed, "rate limiter swept stale records");
        }
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.attempts.lock().len()
    }

    /// Spawn the hourly GC task; exits on shutdown.
    pub fn spawn_gc(
        limiter: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(GC_INTERVAL);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => limiter.sweep(),
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> IpAddr {
        IpAddr::from([10, 0, 0, last])
    }

    #[test]
    fn blocks_at_threshold() {
        let limiter = RateLimiter::new();
        let a = addr(1);
        for _ in 0..4 {
            limiter.record_failure(a);
            assert!(!limiter.is_blocked(a));
        }
        limiter.record_failure(a);
        assert!(limiter.is_blocked(a));
    }

    #[test]
    fn success_clears_counter() {
        let limiter = RateLimiter::new();
        let a = addr(2);
        for _ in 0..4 {
            limiter.record_failure(a);
        }
        limiter.clear(a);
        assert_eq!(limiter.tracked(), 0);
        // the count starts over
        limiter.record_failure(a);
        assert!(!limiter.is_blocked(a));
    }

    #[test]
    fn block_expires_after_window() {
        let limiter =
            RateLimiter::with_limits(2, Duration::from_millis(30), Duration::from_secs(60));
        let a = addr(3);
        limiter.record_failure(a);
        limiter.record_failure(a);
        assert!(limiter.is_blocked(a));
        std::thread::sleep(Duration::from_millis(40));
        assert!(!limiter.is_blocked(a));
    }

    #[test]
    fn further_failures_reapply_window() {
        let limiter =
            RateLimiter::with_limits(2, Duration::from_millis(50), Duration::from_secs(60));
        let a = addr(4);
        limiter.record_failure(a);
        limiter.record_failure(a);
        std::thread::sleep(Duration::from_millis(30));
        // still blocked; a new failure re-arms the full window
        limiter.record_failure(a);
        std::thread::sleep(Duration::from_millis(30));
        assert!(limiter.is_blocked(a));
    }

    #[test]
    fn addresses_are_independent() {
        let limiter = RateLimiter::new();
        for _ in 0..5 {
            limiter.record_failure(addr(5));
        }
        assert!(limiter.is_blocked(addr(5)));
        assert!(!limiter.is_blocked(addr(6)));
    }

    #[test]
    fn sweep_drops_stale_records() {
        let limiter = RateLimiter::with_limits(5, Duration::from_secs(60), Duration::ZERO);
        limiter.record_failure(addr(7));
        std::thread::sleep(Duration::from_millis(5));
        limiter.sweep();
        assert_eq!(limiter.tracked(), 0);
    }
}
