//! Sliding-window-log rate limiter keyed by (identity, action).
//!
//! Every admitted request leaves a timestamp; a request is admitted iff fewer
//! than `limit` timestamps fall inside the trailing window. The map is sharded
//! (`DashMap`), so the admit decision and the append happen under the key's
//! shard lock and unrelated keys never wait on each other.
//!
//! Timestamps come from a monotonic clock anchored to the wall clock once, at
//! construction, so windows stay ordered if the system clock steps backwards.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use dashmap::DashMap;
use tokio::{task::JoinHandle, time::Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::Identity;

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct RateKey {
    identity: Identity,
    action: String,
}

#[derive(Debug)]
struct Window {
    stamps: VecDeque<i64>,
    window_ms: i64,
}

impl Window {
    fn prune(&mut self, now_ms: i64) {
        let cutoff = now_ms - self.window_ms;
        while let Some(&front) = self.stamps.front() {
            if front <= cutoff {
                self.stamps.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Outcome of a rate-limit check. Times are unix epoch milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimitStatus {
    pub allowed: bool,
    pub remaining: u32,
    /// When the oldest request in the window expires.
    pub reset_time_ms: i64,
}

impl RateLimitStatus {
    pub fn retry_after(&self, now_ms: i64) -> Duration {
        Duration::from_millis(u64::try_from(self.reset_time_ms - now_ms).unwrap_or(0))
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    windows: DashMap<RateKey, Window>,
    origin: Instant,
    origin_epoch_ms: i64,
}

impl RateLimiter {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            windows: DashMap::new(),
            origin: Instant::now(),
            origin_epoch_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Current time in unix epoch milliseconds, advancing monotonically.
    pub fn now_ms(&self) -> i64 {
        let elapsed = i64::try_from(self.origin.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.origin_epoch_ms.saturating_add(elapsed)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn check(
        &self,
        identity: &Identity,
        action: &str,
        limit: u32,
        window: Duration,
    ) -> RateLimitStatus {
        self.check_at(identity, action, limit, window, self.now_ms())
    }

    pub fn check_at(
        &self,
        identity: &Identity,
        action: &str,
        limit: u32,
        window: Duration,
        now_ms: i64,
    ) -> RateLimitStatus {
        if !self.enabled {
            return RateLimitStatus {
                allowed: true,
                remaining: limit,
                reset_time_ms: now_ms,
            };
        }

        let window_ms = i64::try_from(window.as_millis()).unwrap_or(i64::MAX);
        if limit == 0 || window_ms == 0 {
            // Misconfigured limits must not take the bot down; admit.
            warn!(%identity, action, limit, window_ms, "rate limiter misconfigured, failing open");
            return RateLimitStatus {
                allowed: true,
                remaining: 1,
                reset_time_ms: now_ms.saturating_add(60_000),
            };
        }

        let key = RateKey {
            identity: identity.clone(),
            action: action.to_string(),
        };
        let mut entry = self.windows.entry(key).or_insert_with(|| Window {
            stamps: VecDeque::new(),
            window_ms,
        });
        entry.window_ms = window_ms;
        entry.prune(now_ms);

        let count = entry.stamps.len();
        if count >= limit as usize {
            let oldest = entry.stamps.front().copied().unwrap_or(now_ms);
            warn!(%identity, action, limit, "rate limit exceeded");
            return RateLimitStatus {
                allowed: false,
                remaining: 0,
                reset_time_ms: oldest.saturating_add(window_ms),
            };
        }

        entry.stamps.push_back(now_ms);
        let oldest = entry.stamps.front().copied().unwrap_or(now_ms);
        RateLimitStatus {
            allowed: true,
            remaining: limit - entry.stamps.len() as u32,
            reset_time_ms: oldest.saturating_add(window_ms),
        }
    }

    /// Number of (identity, action) keys currently tracked.
    pub fn active_keys(&self) -> usize {
        self.windows.len()
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(self.now_ms())
    }

    /// Drop expired timestamps and remove keys left empty. Locks one key at a time.
    pub fn sweep_at(&self, now_ms: i64) -> usize {
        let keys: Vec<RateKey> = self.windows.iter().map(|e| e.key().clone()).collect();

        let mut removed = 0usize;
        for key in keys {
            let empty = match self.windows.get_mut(&key) {
                Some(mut w) => {
                    w.prune(now_ms);
                    w.stamps.is_empty()
                }
                None => false,
            };
            if empty
                && self
                    .windows
                    .remove_if(&key, |_, w| w.stamps.is_empty())
                    .is_some()
            {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!(removed, "swept expired rate-limit windows");
        }
        removed
    }

    /// Run [`RateLimiter::sweep`] every `every` until `cancel` fires.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        every: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(every);
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        limiter.sweep();
                    }
                }
            }
            debug!("rate-limit sweeper stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_secs(60);

    fn alice() -> Identity {
        Identity::new("@alice:x")
    }

    #[test]
    fn admits_limit_then_denies_with_reset_time() {
        let rl = RateLimiter::new(true);
        let t0 = 1_000_000;

        for (i, remaining) in [2, 1, 0].into_iter().enumerate() {
            let s = rl.check_at(&alice(), "ask", 3, MIN, t0 + i as i64 * 10);
            assert!(s.allowed);
            assert_eq!(s.remaining, remaining);
        }

        let denied = rl.check_at(&alice(), "ask", 3, MIN, t0 + 30);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_time_ms, t0 + 60_000);
        assert_eq!(denied.retry_after(t0 + 30), Duration::from_millis(59_970));
    }

    #[test]
    fn window_slides_one_request_at_a_time() {
        let rl = RateLimiter::new(true);
        let t0 = 5_000;
        rl.check_at(&alice(), "ask", 2, MIN, t0);
        rl.check_at(&alice(), "ask", 2, MIN, t0 + 1_000);
        assert!(!rl.check_at(&alice(), "ask", 2, MIN, t0 + 59_999).allowed);

        // Exactly one window after the first request, it no longer counts.
        let s = rl.check_at(&alice(), "ask", 2, MIN, t0 + 60_000);
        assert!(s.allowed);
        assert_eq!(s.reset_time_ms, t0 + 1_000 + 60_000);
        assert!(!rl.check_at(&alice(), "ask", 2, MIN, t0 + 60_500).allowed);
    }

    #[test]
    fn denied_requests_do_not_consume_quota() {
        let rl = RateLimiter::new(true);
        rl.check_at(&alice(), "ask", 1, MIN, 0);
        for t in 1..10 {
            assert!(!rl.check_at(&alice(), "ask", 1, MIN, t).allowed);
        }
        assert!(rl.check_at(&alice(), "ask", 1, MIN, 60_000).allowed);
    }

    #[test]
    fn keys_are_independent() {
        let rl = RateLimiter::new(true);
        assert!(rl.check_at(&alice(), "ask", 1, MIN, 0).allowed);
        assert!(rl.check_at(&alice(), "find", 1, MIN, 0).allowed);
        assert!(rl.check_at(&Identity::new("@bob:x"), "ask", 1, MIN, 0).allowed);
        assert!(!rl.check_at(&alice(), "ask", 1, MIN, 0).allowed);
        assert_eq!(rl.active_keys(), 3);
    }

    #[test]
    fn disabled_or_misconfigured_limiter_admits() {
        let off = RateLimiter::new(false);
        for _ in 0..100 {
            assert!(off.check_at(&alice(), "ask", 1, MIN, 0).allowed);
        }

        let on = RateLimiter::new(true);
        assert!(on.check_at(&alice(), "ask", 0, MIN, 0).allowed);
        assert!(on.check_at(&alice(), "ask", 5, Duration::ZERO, 0).allowed);
        assert_eq!(on.active_keys(), 0);
    }

    #[test]
    fn sweep_removes_only_fully_expired_keys() {
        let rl = RateLimiter::new(true);
        rl.check_at(&alice(), "ask", 5, MIN, 0);
        rl.check_at(&alice(), "find", 5, Duration::from_secs(600), 0);
        rl.check_at(&Identity::new("@bob:x"), "ask", 5, MIN, 50_000);

        assert_eq!(rl.sweep_at(70_000), 1);
        assert_eq!(rl.active_keys(), 2);
        assert_eq!(rl.sweep_at(200_000), 1);
        assert_eq!(rl.active_keys(), 1);
    }

    #[test]
    fn concurrent_checks_on_one_key_never_over_admit() {
        let rl = RateLimiter::new(true);
        let admitted = std::sync::atomic::AtomicU32::new(0);

        std::thread::scope(|s| {
            for _ in 0..8 {
                s.spawn(|| {
                    for _ in 0..50 {
                        if rl.check_at(&alice(), "ask", 100, MIN, 1_000).allowed {
                            admitted.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        }
                    }
                });
            }
        });

        assert_eq!(admitted.load(std::sync::atomic::Ordering::SeqCst), 100);
    }

    #[tokio::test(start_paused = true)]
    async fn clock_follows_monotonic_time() {
        let rl = RateLimiter::new(true);
        let a = rl.now_ms();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(rl.now_ms() - a, 5_000);
    }

    #[tokio::test(start_paused = true)]
    async fn sweeper_evicts_expired_keys() {
        let rl = Arc::new(RateLimiter::new(true));
        rl.check(&alice(), "ask", 5, MIN);
        rl.check(&Identity::new("@bob:x"), "find", 5, MIN);
        assert_eq!(rl.active_keys(), 2);

        let cancel = CancellationToken::new();
        let handle = rl.spawn_sweeper(Duration::from_secs(10), cancel.clone());

        tokio::time::advance(Duration::from_secs(30)).await;
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(rl.active_keys(), 2);

        tokio::time::advance(Duration::from_secs(45)).await;
        for _ in 0..10 {
            if rl.active_keys() == 0 {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(rl.active_keys(), 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn sweeper_stops_on_cancel() {
        let rl = Arc::new(RateLimiter::new(true));
        let cancel = CancellationToken::new();
        let handle = rl.spawn_sweeper(Duration::from_millis(5), cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }
}
