// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Rate-limited versions of the [`tracing`] warning macro.
//!
//! Use these when a guest can trigger an event as often as it likes, so that
//! a noisy guest cannot drown out the rest of the log.
//!
//! Each call site has its own limiter. Only warnings are covered: the limit
//! is checked before the level filter, so limiting debug or trace events
//! would put a lock on every disabled event.

#![forbid(unsafe_code)]

use parking_lot::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Instant;
#[doc(hidden)]
pub use tracing;

const PERIOD_MS: u32 = 5000;
const EVENTS_PER_PERIOD: u32 = 10;

static DISABLE_RATE_LIMITING: AtomicBool = AtomicBool::new(false);

/// Disables or reenables rate limiting globally.
///
/// Rate limiting defaults to enabled.
pub fn disable_rate_limiting(disabled: bool) {
    DISABLE_RATE_LIMITING.store(disabled, Ordering::Relaxed);
}

#[doc(hidden)]
pub struct RateLimiter {
    state: Mutex<RateLimiterState>,
}

struct RateLimiterState {
    period_ms: u32,
    events_per_period: u32,
    start: Option<Instant>,
    events: u32,
    missed: u64,
}

#[doc(hidden)]
#[derive(Debug)]
pub struct RateLimited;

impl RateLimiter {
    pub const fn new_default() -> Self {
        Self::new(PERIOD_MS, EVENTS_PER_PERIOD)
    }

    pub const fn new(period_ms: u32, events_per_period: u32) -> Self {
        Self {
            state: Mutex::new(RateLimiterState {
                period_ms,
                events_per_period,
                start: None,
                events: 0,
                missed: 0,
            }),
        }
    }

    /// Returns `Ok(missed_events)` if this event should be logged.
    ///
    /// `missed_events` is `Some(n)` if there were any missed events or if this
    /// event is the last one before rate limiting kicks in.
    pub fn event(&self) -> Result<Option<u64>, RateLimited> {
        if DISABLE_RATE_LIMITING.load(Ordering::Relaxed) {
            return Ok(None);
        }

        // Contended events are dropped rather than waited on.
        let mut state = self.state.try_lock().ok_or(RateLimited)?;
        let now = Instant::now();
        let period_ms = state.period_ms;
        let start = state.start.get_or_insert(now);
        if now.duration_since(*start).as_millis() > u128::from(period_ms) {
            *start = now;
            state.events = 0;
        }
        if state.events >= state.events_per_period {
            state.missed += 1;
            return Err(RateLimited);
        }
        state.events += 1;
        let missed = std::mem::take(&mut state.missed);
        Ok((missed != 0 || state.events == state.events_per_period).then_some(missed))
    }
}

/// As [`tracing::warn!`], but rate limited.
///
/// ```
/// use tracelimit::warn_ratelimited;
/// warn_ratelimited!(vector = 3, "illegal vector");
/// ```
#[macro_export]
macro_rules! warn_ratelimited {
    ($($rest:tt)*) => {
        {
            static RATE_LIMITER: $crate::RateLimiter = $crate::RateLimiter::new_default();
            if let Ok(missed_events) = RATE_LIMITER.event() {
                $crate::tracing::warn!(dropped_ratelimited = missed_events, $($rest)*);
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_events_per_period() {
        let limiter = RateLimiter::new(60_000, 3);
        assert_eq!(limiter.event().ok(), Some(None));
        assert_eq!(limiter.event().ok(), Some(None));
        // The last event before limiting reports the missed count.
        assert_eq!(limiter.event().ok(), Some(Some(0)));
        for _ in 0..100 {
            assert!(limiter.event().is_err());
        }
    }

    #[test]
    fn new_period_reports_missed_events() {
        let limiter = RateLimiter::new(0, 1);
        assert!(limiter.event().is_ok());
        assert!(limiter.event().is_err());
        std::thread::sleep(std::time::Duration::from_millis(2));
        assert_eq!(limiter.event().ok(), Some(Some(1)));
    }
}
