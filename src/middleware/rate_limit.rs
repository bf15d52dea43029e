//! Per-client request rate limiting.
//!
//! # Algorithms
//!
//! - [`FixedWindowLimiter`] (default): a reset-at-boundary counter per key.
//!   The first request from a key opens a window of `window` length; up to
//!   `max_requests` requests are allowed inside it, the rest are rejected
//!   until the window ends. Not a rolling window: a client can issue
//!   `2 * max_requests` across a window boundary.
//! - [`GcraLimiter`]: the Governor crate's Generic Cell Rate Algorithm,
//!   with a quota of `max_requests` per `window` and the same burst size.
//!   Smoother, but ignores the caller-supplied clock.
//!
//! # Shared State
//!
//! The key → entry map is the only state shared across concurrent requests.
//! [`FixedWindowLimiter`] guards it with a single mutex held only for the
//! map lookup; nothing awaits while it is held.
//!
//! # Response Headers
//!
//! On rate limit exceeded (429), the error renderer adds:
//! - `Retry-After`: Seconds until the window resets (min 1)
//! - `X-RateLimit-Limit`: Configured max requests per window
//! - `X-RateLimit-Remaining`: `0`
//!
//! # Eviction
//!
//! Entries whose window has ended are dead weight. [`spawn_eviction`] runs
//! [`RateLimiter::evict_expired`] periodically; correctness does not depend
//! on it.

use std::collections::HashMap;
use std::fmt;
use std::num::NonZeroU32;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use governor::clock::{Clock, DefaultClock};
use governor::state::keyed::DefaultKeyedStateStore;
use governor::Quota;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::config::{Config, RateLimitStrategy};
use crate::error::ApiError;

type KeyedGovernor = governor::RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

/// Error type for rate limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitConfigError {
    /// `max_requests` cannot be zero.
    ZeroRequests,
    /// `window` cannot be zero.
    ZeroWindow,
}

impl fmt::Display for RateLimitConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitConfigError::ZeroRequests => write!(
                f,
                "max requests must be greater than 0; leave the stage out for no limiting"
            ),
            RateLimitConfigError::ZeroWindow => write!(f, "window must be greater than 0"),
        }
    }
}

impl std::error::Error for RateLimitConfigError {}

/// Outcome of an allowed request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub limit: u32,
    /// Requests left in the current window, when the algorithm knows it.
    pub remaining: Option<u32>,
    /// Time until the current window resets.
    pub reset_after: Duration,
}

/// Keyed request budget. Implementations must be safe to call from many
/// requests at once and must not suspend.
pub trait RateLimiter: Send + Sync {
    /// Count one request for `key` at `now`, or reject it with a
    /// RateLimit error carrying the retry-after duration.
    fn check(&self, key: &str, now: Instant) -> Result<RateLimitDecision, ApiError>;

    /// Drop entries that no longer influence any decision. Returns how many
    /// were removed.
    fn evict_expired(&self, now: Instant) -> usize;

    /// Configured maximum requests per window.
    fn limit(&self) -> u32;

    /// Number of tracked keys.
    fn tracked_keys(&self) -> usize;
}

/// Build the limiter selected by configuration, or `None` when disabled.
pub fn limiter_from_config(
    config: &Config,
) -> Result<Option<Arc<dyn RateLimiter>>, RateLimitConfigError> {
    if !config.rate_limiting_enabled() {
        return Ok(None);
    }
    let max = config.rate_limit_max_requests;
    let window = config.rate_limit_window;
    let limiter: Arc<dyn RateLimiter> = match config.rate_limit_strategy {
        RateLimitStrategy::FixedWindow => Arc::new(FixedWindowLimiter::new(max, window)?),
        RateLimitStrategy::Gcra => Arc::new(GcraLimiter::new(max, window)?),
    };
    Ok(Some(limiter))
}

// =============================================================================
// Fixed window
// =============================================================================

/// Per-key counter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitEntry {
    pub count: u32,
    pub window_reset_at: Instant,
}

/// Reset-at-boundary counter per key.
#[derive(Debug)]
pub struct FixedWindowLimiter {
    max_requests: u32,
    window: Duration,
    entries: Mutex<HashMap<String, RateLimitEntry>>,
}

impl FixedWindowLimiter {
    /// # Errors
    ///
    /// Returns an error if `max_requests` or `window` is zero.
    pub fn new(max_requests: u32, window: Duration) -> Result<Self, RateLimitConfigError> {
        if max_requests == 0 {
            return Err(RateLimitConfigError::ZeroRequests);
        }
        if window.is_zero() {
            return Err(RateLimitConfigError::ZeroWindow);
        }
        Ok(Self {
            max_requests,
            window,
            entries: Mutex::new(HashMap::new()),
        })
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Current entry for `key`, if tracked.
    pub fn entry(&self, key: &str) -> Option<RateLimitEntry> {
        self.lock().get(key).copied()
    }

    // A panic while holding the lock cannot leave an entry half-written,
    // so a poisoned map is still usable.
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, RateLimitEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fresh_entry(&self, now: Instant) -> RateLimitEntry {
        RateLimitEntry {
            count: 1,
            window_reset_at: now + self.window,
        }
    }

    fn allowed(&self, entry: &RateLimitEntry, now: Instant) -> RateLimitDecision {
        RateLimitDecision {
            limit: self.max_requests,
            remaining: Some(self.max_requests.saturating_sub(entry.count)),
            reset_after: entry.window_reset_at.saturating_duration_since(now),
        }
    }
}

impl RateLimiter for FixedWindowLimiter {
    fn check(&self, key: &str, now: Instant) -> Result<RateLimitDecision, ApiError> {
        let mut entries = self.lock();

        let Some(entry) = entries.get_mut(key) else {
            let entry = self.fresh_entry(now);
            let decision = self.allowed(&entry, now);
            entries.insert(key.to_string(), entry);
            return Ok(decision);
        };

        if now >= entry.window_reset_at {
            *entry = self.fresh_entry(now);
            return Ok(self.allowed(entry, now));
        }

        if entry.count >= self.max_requests {
            return Err(ApiError::rate_limited(
                entry.window_reset_at.saturating_duration_since(now),
                self.max_requests,
            ));
        }

        entry.count += 1;
        Ok(self.allowed(entry, now))
    }

    fn evict_expired(&self, now: Instant) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, entry| now < entry.window_reset_at);
        before - entries.len()
    }

    fn limit(&self) -> u32 {
        self.max_requests
    }

    fn tracked_keys(&self) -> usize {
        self.lock().len()
    }
}

// =============================================================================
// GCRA
// =============================================================================

/// Governor-backed keyed limiter.
pub struct GcraLimiter {
    limiter: KeyedGovernor,
    max_requests: u32,
}

impl fmt::Debug for GcraLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GcraLimiter")
            .field("max_requests", &self.max_requests)
            .finish_non_exhaustive()
    }
}

impl GcraLimiter {
    /// # Errors
    ///
    /// Returns an error if `max_requests` or `window` is zero.
    pub fn new(max_requests: u32, window: Duration) -> Result<Self, RateLimitConfigError> {
        let burst = NonZeroU32::new(max_requests).ok_or(RateLimitConfigError::ZeroRequests)?;
        // One cell replenishes every window / max_requests
        let quota = Quota::with_period(window / max_requests)
            .ok_or(RateLimitConfigError::ZeroWindow)?
            .allow_burst(burst);

        Ok(Self {
            limiter: governor::RateLimiter::keyed(quota),
            max_requests,
        })
    }
}

impl RateLimiter for GcraLimiter {
    fn check(&self, key: &str, _now: Instant) -> Result<RateLimitDecision, ApiError> {
        match self.limiter.check_key(&key.to_string()) {
            Ok(()) => Ok(RateLimitDecision {
                limit: self.max_requests,
                remaining: None,
                reset_after: Duration::ZERO,
            }),
            Err(not_until) => {
                let wait_time = not_until.wait_time_from(DefaultClock::default().now());
                Err(ApiError::rate_limited(wait_time, self.max_requests))
            }
        }
    }

    fn evict_expired(&self, _now: Instant) -> usize {
        let before = self.limiter.len();
        self.limiter.retain_recent();
        self.limiter.shrink_to_fit();
        before.saturating_sub(self.limiter.len())
    }

    fn limit(&self) -> u32 {
        self.max_requests
    }

    fn tracked_keys(&self) -> usize {
        self.limiter.len()
    }
}

// =============================================================================
// Keying and eviction
// =============================================================================

/// What a request is counted against.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RateLimitKey {
    /// Resolved client address.
    #[default]
    ClientAddress,
    /// Authenticated user id, falling back to the client address.
    UserOrAddress,
}

impl RateLimitKey {
    pub fn resolve(self, client_address: &str, user_id: Option<&str>) -> String {
        match (self, user_id) {
            (RateLimitKey::UserOrAddress, Some(user_id)) => format!("user:{user_id}"),
            _ => client_address.to_string(),
        }
    }
}

/// Periodically evict stale entries until `token` is cancelled.
pub fn spawn_eviction(
    limiter: Arc<dyn RateLimiter>,
    interval: Duration,
    tracker: &TaskTracker,
    token: CancellationToken,
) {
    if interval.is_zero() {
        return;
    }

    tracker.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => {
                    let evicted = limiter.evict_expired(Instant::now());
                    if evicted > 0 {
                        debug!(
                            evicted,
                            remaining = limiter.tracked_keys(),
                            "Evicted expired rate limit entries"
                        );
                    }
                }
            }
        }
        debug!("Rate limit eviction stopped");
    });
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn test_zero_values_rejected() {
        assert_eq!(
            FixedWindowLimiter::new(0, WINDOW).unwrap_err(),
            RateLimitConfigError::ZeroRequests
        );
        assert_eq!(
            FixedWindowLimiter::new(5, Duration::ZERO).unwrap_err(),
            RateLimitConfigError::ZeroWindow
        );
        assert!(GcraLimiter::new(0, WINDOW).is_err());
        assert!(GcraLimiter::new(5, Duration::ZERO).is_err());
    }

    #[test]
    fn test_first_request_creates_entry() {
        let limiter = FixedWindowLimiter::new(3, WINDOW).unwrap();
        let now = Instant::now();

        let decision = limiter.check("10.0.0.1", now).unwrap();
        assert_eq!(decision.remaining, Some(2));
        assert_eq!(decision.reset_after, WINDOW);

        let entry = limiter.entry("10.0.0.1").unwrap();
        assert_eq!(entry.count, 1);
        assert_eq!(entry.window_reset_at, now + WINDOW);
    }

    #[test]
    fn test_limit_is_inclusive() {
        let limiter = FixedWindowLimiter::new(3, WINDOW).unwrap();
        let start = Instant::now();

        for i in 0..3 {
            let decision = limiter
                .check("client", start + Duration::from_secs(i))
                .unwrap();
            assert_eq!(decision.remaining, Some(2 - i as u32));
        }

        let err = limiter
            .check("client", start + Duration::from_secs(20))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimit);
        match err {
            ApiError::RateLimit {
                retry_after, limit, ..
            } => {
                assert_eq!(retry_after, Duration::from_secs(40));
                assert_eq!(limit, 3);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_rejection_does_not_consume_budget() {
        let limiter = FixedWindowLimiter::new(1, WINDOW).unwrap();
        let now = Instant::now();

        limiter.check("client", now).unwrap();
        assert!(limiter.check("client", now).is_err());
        assert!(limiter.check("client", now).is_err());
        assert_eq!(limiter.entry("client").unwrap().count, 1);
    }

    #[test]
    fn test_window_reset() {
        let limiter = FixedWindowLimiter::new(2, WINDOW).unwrap();
        let start = Instant::now();

        limiter.check("client", start).unwrap();
        limiter.check("client", start).unwrap();
        assert!(limiter.check("client", start + WINDOW - Duration::from_millis(1)).is_err());

        // Exactly at the boundary the window is over
        let decision = limiter.check("client", start + WINDOW).unwrap();
        assert_eq!(decision.remaining, Some(1));
        let entry = limiter.entry("client").unwrap();
        assert_eq!(entry.count, 1);
        assert_eq!(entry.window_reset_at, start + WINDOW + WINDOW);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = FixedWindowLimiter::new(1, WINDOW).unwrap();
        let now = Instant::now();

        limiter.check("a", now).unwrap();
        assert!(limiter.check("a", now).is_err());
        assert!(limiter.check("b", now).is_ok());
    }

    #[test]
    fn test_concurrent_checks_never_exceed_limit() {
        let limiter = Arc::new(FixedWindowLimiter::new(50, WINDOW).unwrap());
        let now = Instant::now();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..20)
                        .filter(|_| limiter.check("shared", now).is_ok())
                        .count()
                })
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 50);
    }

    #[test]
    fn test_evict_expired() {
        let limiter = FixedWindowLimiter::new(5, WINDOW).unwrap();
        let start = Instant::now();

        limiter.check("old", start).unwrap();
        limiter.check("new", start + Duration::from_secs(30)).unwrap();

        assert_eq!(limiter.evict_expired(start + WINDOW), 1);
        assert!(limiter.entry("old").is_none());
        assert!(limiter.entry("new").is_some());
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_gcra_allows_burst_then_rejects() {
        let limiter = GcraLimiter::new(3, WINDOW).unwrap();
        let now = Instant::now();

        for _ in 0..3 {
            assert!(limiter.check("client", now).is_ok());
        }
        let err = limiter.check("client", now).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimit);
        assert!(limiter.check("other", now).is_ok());
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[test]
    fn test_rate_limit_key() {
        assert_eq!(
            RateLimitKey::ClientAddress.resolve("1.2.3.4", Some("u-1")),
            "1.2.3.4"
        );
        assert_eq!(
            RateLimitKey::UserOrAddress.resolve("1.2.3.4", Some("u-1")),
            "user:u-1"
        );
        assert_eq!(RateLimitKey::UserOrAddress.resolve("1.2.3.4", None), "1.2.3.4");
    }

    #[test]
    fn test_limiter_from_config() {
        let mut config = Config::default();
        config.rate_limit_max_requests = 0;
        assert!(limiter_from_config(&config).unwrap().is_none());

        config.rate_limit_max_requests = 10;
        config.rate_limit_strategy = RateLimitStrategy::Gcra;
        let limiter = limiter_from_config(&config).unwrap().unwrap();
        assert_eq!(limiter.limit(), 10);
    }

    #[tokio::test]
    async fn test_eviction_task_stops_on_cancel() {
        let limiter: Arc<dyn RateLimiter> = Arc::new(FixedWindowLimiter::new(1, WINDOW).unwrap());
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();

        spawn_eviction(limiter, Duration::from_millis(10), &tracker, token.clone());
        token.cancel();
        tracker.close();
        tracker.wait().await;
    }
}
