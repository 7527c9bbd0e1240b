//! Fixed-window request limiting
//!
//! Each key owns a counter and a window start. A request outside the current
//! window starts a new one; a request that pushes the counter past the budget
//! is denied until the window ends. Bursts straddling a window boundary can
//! reach twice the budget.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::clock::Clock;

/// Tracked keys above which expired windows are swept
const PRUNE_THRESHOLD: usize = 10_000;

/// Hard cap on tracked keys; unseen keys are refused beyond it
pub const DEFAULT_MAX_TRACKED_KEYS: usize = 100_000;

/// Outcome of a rate limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Seconds until the window resets; set only when denied
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl RateLimitDecision {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            retry_after: None,
        }
    }

    pub fn deny(retry_after: u64) -> Self {
        Self {
            allowed: false,
            retry_after: Some(retry_after.max(1)),
        }
    }
}

/// Per-key request budget
///
/// Process-local by default; a shared counter store can implement this to
/// keep the budget across instances.
#[async_trait]
pub trait RateLimiter: Send + Sync {
    async fn check(&self, key: &str, window: Duration, max_requests: u32) -> RateLimitDecision;
}

#[derive(Debug, Clone)]
struct Window {
    started: DateTime<Utc>,
    length: chrono::Duration,
    count: u32,
}

impl Window {
    fn ends_at(&self) -> DateTime<Utc> {
        self.started
            .checked_add_signed(self.length)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[derive(Debug, Default)]
struct Windows {
    entries: HashMap<String, Window>,
    /// Earliest end among tracked windows; may lag behind after a reset
    next_expiry: Option<DateTime<Utc>>,
}

impl Windows {
    fn prune(&mut self, now: DateTime<Utc>) {
        let before = self.entries.len();
        self.entries.retain(|_, w| w.ends_at() > now);
        self.next_expiry = self.entries.values().map(Window::ends_at).min();
        debug!(
            removed = before - self.entries.len(),
            tracked = self.entries.len(),
            "pruned expired rate limit windows"
        );
    }
}

/// In-memory fixed-window limiter
pub struct FixedWindowLimiter {
    windows: Mutex<Windows>,
    clock: Arc<dyn Clock>,
    max_keys: usize,
    prune_threshold: usize,
}

impl FixedWindowLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self::with_max_keys(clock, DEFAULT_MAX_TRACKED_KEYS)
    }

    /// Limiter that tracks at most `max_keys` keys at once
    pub fn with_max_keys(clock: Arc<dyn Clock>, max_keys: usize) -> Self {
        let max_keys = max_keys.max(1);
        Self {
            windows: Mutex::new(Windows::default()),
            clock,
            max_keys,
            prune_threshold: PRUNE_THRESHOLD.min(max_keys),
        }
    }

    /// Number of keys currently tracked
    pub async fn tracked_keys(&self) -> usize {
        self.windows.lock().await.entries.len()
    }
}

fn seconds_until(at: DateTime<Utc>, now: DateTime<Utc>) -> u64 {
    let remaining_ms = (at - now).num_milliseconds().max(0) as u64;
    remaining_ms.div_ceil(1000)
}

#[async_trait]
impl RateLimiter for FixedWindowLimiter {
    async fn check(&self, key: &str, window: Duration, max_requests: u32) -> RateLimitDecision {
        let now = self.clock.now();
        let length = chrono::Duration::from_std(window).unwrap_or(chrono::Duration::MAX);
        let mut windows = self.windows.lock().await;

        if windows.entries.len() >= self.prune_threshold
            && windows.next_expiry.is_some_and(|t| now >= t)
        {
            windows.prune(now);
        }

        if !windows.entries.contains_key(key) && windows.entries.len() >= self.max_keys {
            let retry_after = windows
                .next_expiry
                .map_or(window.as_secs(), |t| seconds_until(t, now));
            warn!(
                tracked = windows.entries.len(),
                retry_after, "rate limiter at capacity, refusing new key"
            );
            return RateLimitDecision::deny(retry_after);
        }

        let Windows {
            entries,
            next_expiry,
        } = &mut *windows;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Window {
            started: now,
            length,
            count: 0,
        });

        if entry.count == 0 || now >= entry.ends_at() {
            entry.started = now;
            entry.length = length;
            entry.count = 0;
            let ends_at = entry.ends_at();
            *next_expiry = Some(next_expiry.map_or(ends_at, |t| t.min(ends_at)));
        }

        entry.count = entry.count.saturating_add(1);

        if entry.count > max_requests {
            let retry_after = seconds_until(entry.ends_at(), now);
            debug!(key, count = entry.count, retry_after, "rate limit exceeded");
            return RateLimitDecision::deny(retry_after);
        }

        RateLimitDecision::allow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const WINDOW: Duration = Duration::from_secs(60);

    fn limiter() -> (FixedWindowLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (FixedWindowLimiter::new(clock.clone()), clock)
    }

    #[tokio::test]
    async fn test_denies_after_budget() {
        let (limiter, _clock) = limiter();

        for _ in 0..5 {
            assert!(limiter.check("device-auth:1.2.3.4", WINDOW, 5).await.allowed);
        }

        let denied = limiter.check("device-auth:1.2.3.4", WINDOW, 5).await;
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(60));
    }

    #[tokio::test]
    async fn test_retry_after_counts_down() {
        let (limiter, clock) = limiter();
        limiter.check("k", WINDOW, 1).await;

        clock.advance(chrono::Duration::milliseconds(45_500));
        let denied = limiter.check("k", WINDOW, 1).await;
        assert_eq!(denied.retry_after, Some(15));

        // Half a second before the window closes still reports a full second
        clock.advance(chrono::Duration::milliseconds(14_000));
        let denied = limiter.check("k", WINDOW, 1).await;
        assert_eq!(denied.retry_after, Some(1));
    }

    #[tokio::test]
    async fn test_new_window_resets_budget() {
        let (limiter, clock) = limiter();

        for _ in 0..3 {
            limiter.check("k", WINDOW, 2).await;
        }
        assert!(!limiter.check("k", WINDOW, 2).await.allowed);

        clock.advance(chrono::Duration::seconds(60));
        assert!(limiter.check("k", WINDOW, 2).await.allowed);
        assert!(limiter.check("k", WINDOW, 2).await.allowed);
        assert!(!limiter.check("k", WINDOW, 2).await.allowed);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let (limiter, _clock) = limiter();

        assert!(limiter.check("device-auth:a", WINDOW, 1).await.allowed);
        assert!(!limiter.check("device-auth:a", WINDOW, 1).await.allowed);
        assert!(limiter.check("device-auth:b", WINDOW, 1).await.allowed);
        assert!(limiter.check("device-auth-poll:a", WINDOW, 1).await.allowed);
    }

    #[tokio::test]
    async fn test_boundary_burst_allows_double_budget() {
        let (limiter, clock) = limiter();

        // First request opens the window; the rest land just before it closes
        limiter.check("k", WINDOW, 3).await;
        clock.advance(chrono::Duration::seconds(59));
        limiter.check("k", WINDOW, 3).await;
        limiter.check("k", WINDOW, 3).await;

        clock.advance(chrono::Duration::seconds(1));
        let mut allowed = 0;
        for _ in 0..4 {
            if limiter.check("k", WINDOW, 3).await.allowed {
                allowed += 1;
            }
        }
        assert_eq!(allowed, 3);
    }

    #[tokio::test]
    async fn test_deny_never_reports_zero() {
        assert_eq!(RateLimitDecision::deny(0).retry_after, Some(1));
    }

    #[tokio::test]
    async fn test_refuses_new_keys_at_capacity() {
        let clock = Arc::new(ManualClock::default());
        let limiter = FixedWindowLimiter::with_max_keys(clock.clone(), 2);

        assert!(limiter.check("a", WINDOW, 5).await.allowed);
        clock.advance(chrono::Duration::seconds(10));
        assert!(limiter.check("b", WINDOW, 5).await.allowed);

        let refused = limiter.check("c", WINDOW, 5).await;
        assert!(!refused.allowed);
        assert_eq!(refused.retry_after, Some(50));
        // Known keys keep their own budget
        assert!(limiter.check("a", WINDOW, 5).await.allowed);
        assert_eq!(limiter.tracked_keys().await, 2);

        // Once the oldest window ends it is pruned and the slot reused
        clock.advance(chrono::Duration::seconds(50));
        assert!(limiter.check("c", WINDOW, 5).await.allowed);
        assert_eq!(limiter.tracked_keys().await, 2);
    }

    #[tokio::test]
    async fn test_prunes_only_after_a_window_ends() {
        let clock = Arc::new(ManualClock::default());
        let limiter = FixedWindowLimiter::with_max_keys(clock.clone(), 3);

        for key in ["a", "b", "c"] {
            limiter.check(key, WINDOW, 5).await;
        }
        clock.advance(chrono::Duration::seconds(30));
        limiter.check("a", WINDOW, 5).await;
        assert_eq!(limiter.tracked_keys().await, 3);

        clock.advance(chrono::Duration::seconds(30));
        limiter.check("a", WINDOW, 5).await;
        assert_eq!(limiter.tracked_keys().await, 1);
    }
}
