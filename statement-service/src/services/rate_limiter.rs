//! Fixed-window rate limiter keyed by arbitrary strings.
//!
//! Windows reset entirely at interval boundaries rather than sliding.
//! That is cheap and sufficient here: the consuming invariant is "no
//! more than N retrievals per account per hour", not smoothing.
//!
//! Concurrent checks against the same key are serialized through the
//! dashmap entry guard, so two racing callers can never both increment
//! past the limit.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;

#[derive(Debug, Clone)]
struct Window {
    count: u32,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
}

/// Outcome of a rate limit check.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub count: u32,
    pub limit: u32,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    /// Seconds until the window resets; only set when denied.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Read-only view of a key's current window.
#[derive(Debug, Clone, Serialize)]
pub struct WindowStatus {
    pub count: u32,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

#[derive(Default)]
pub struct RateLimiter {
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Check-and-increment `key` against `limit` actions per
    /// `window_secs`. Expired windows are atomically replaced.
    pub fn check(&self, key: &str, limit: u32, window_secs: u64) -> RateLimitDecision {
        self.check_at(key, limit, window_secs, Utc::now())
    }

    fn check_at(
        &self,
        key: &str,
        limit: u32,
        window_secs: u64,
        now: DateTime<Utc>,
    ) -> RateLimitDecision {
        let mut entry = self.windows.entry(key.to_string()).or_insert_with(|| Window {
            count: 0,
            window_start: now,
            window_end: now + Duration::seconds(window_secs as i64),
        });

        if now >= entry.window_end {
            // Hard reset at window expiry.
            entry.count = 0;
            entry.window_start = now;
            entry.window_end = now + Duration::seconds(window_secs as i64);
        }

        if entry.count >= limit {
            let retry_after = (entry.window_end - now).num_seconds().max(0) as u64;
            metrics::counter!("rate_limit_denied_total").increment(1);
            return RateLimitDecision {
                allowed: false,
                count: entry.count,
                limit,
                window_start: entry.window_start,
                window_end: entry.window_end,
                retry_after: Some(retry_after),
            };
        }

        entry.count += 1;
        RateLimitDecision {
            allowed: true,
            count: entry.count,
            limit,
            window_start: entry.window_start,
            window_end: entry.window_end,
            retry_after: None,
        }
    }

    /// Delete the window for a key.
    pub fn reset(&self, key: &str) {
        self.windows.remove(key);
    }

    /// Read-only peek at the current window, without incrementing.
    pub fn status(&self, key: &str) -> Option<WindowStatus> {
        self.windows.get(key).map(|w| WindowStatus {
            count: w.count,
            window_start: w.window_start,
            window_end: w.window_end,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourth_check_within_window_is_denied() {
        let limiter = RateLimiter::new();
        let now = Utc::now();

        for i in 1..=3 {
            let decision = limiter.check_at("account:a", 3, 60, now);
            assert!(decision.allowed);
            assert_eq!(decision.count, i);
        }

        let denied = limiter.check_at("account:a", 3, 60, now + Duration::seconds(10));
        assert!(!denied.allowed);
        assert_eq!(denied.count, 3);
        assert!(denied.retry_after.unwrap() <= 60);
    }

    #[test]
    fn expired_window_resets_to_count_one() {
        let limiter = RateLimiter::new();
        let now = Utc::now();

        for _ in 0..3 {
            limiter.check_at("account:a", 3, 60, now);
        }
        assert!(!limiter.check_at("account:a", 3, 60, now).allowed);

        let later = now + Duration::seconds(61);
        let decision = limiter.check_at("account:a", 3, 60, later);
        assert!(decision.allowed);
        assert_eq!(decision.count, 1);
        assert_eq!(decision.window_start, later);
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new();
        let now = Utc::now();

        limiter.check_at("account:a", 1, 60, now);
        assert!(!limiter.check_at("account:a", 1, 60, now).allowed);
        assert!(limiter.check_at("account:b", 1, 60, now).allowed);
    }

    #[test]
    fn reset_deletes_window() {
        let limiter = RateLimiter::new();
        let now = Utc::now();

        limiter.check_at("account:a", 1, 60, now);
        assert!(!limiter.check_at("account:a", 1, 60, now).allowed);

        limiter.reset("account:a");
        assert!(limiter.check_at("account:a", 1, 60, now).allowed);
    }

    #[test]
    fn status_peek_does_not_increment() {
        let limiter = RateLimiter::new();
        let now = Utc::now();

        limiter.check_at("account:a", 5, 60, now);
        let status = limiter.status("account:a").unwrap();
        assert_eq!(status.count, 1);
        let status = limiter.status("account:a").unwrap();
        assert_eq!(status.count, 1);
        assert!(limiter.status("account:missing").is_none());
    }

    #[test]
    fn concurrent_checks_never_exceed_limit() {
        use std::sync::Arc;

        let limiter = Arc::new(RateLimiter::new());
        let mut handles = Vec::new();

        for _ in 0..16 {
            let limiter = limiter.clone();
            handles.push(std::thread::spawn(move || {
                limiter.check("account:a", 10, 3600).allowed
            }));
        }

        let allowed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|allowed| *allowed)
            .count();
        assert_eq!(allowed, 10);
    }
}
