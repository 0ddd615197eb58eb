// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Rate-limited tracing macros.
//!
//! Events that can be triggered by a device or a remote peer (malformed
//! frames, stale completions) must not be able to flood the log. Each call
//! site gets its own limiter: at most [`EVENTS_PER_PERIOD`] events are emitted
//! per [`PERIOD`], and the next emitted event reports how many were dropped.

#![forbid(unsafe_code)]

#[doc(hidden)]
pub use tracing;

use parking_lot::Mutex;
use std::time::Duration;
use std::time::Instant;

/// The length of a rate-limiting period.
pub const PERIOD: Duration = Duration::from_secs(5);

/// The number of events allowed per call site in each period.
pub const EVENTS_PER_PERIOD: u32 = 10;

/// Per-call-site rate limiter used by the macros in this crate.
#[doc(hidden)]
pub struct RateLimiter {
    state: Mutex<LimiterState>,
}

struct LimiterState {
    period_start: Option<Instant>,
    events: u32,
    missed: u64,
}

/// The event was dropped by the rate limiter.
#[doc(hidden)]
#[derive(Debug)]
pub struct RateLimited;

impl RateLimiter {
    #[doc(hidden)]
    pub const fn new() -> Self {
        Self {
            state: parking_lot::const_mutex(LimiterState {
                period_start: None,
                events: 0,
                missed: 0,
            }),
        }
    }

    /// Accounts for one event. Returns the number of events dropped since the
    /// last emitted one, or `Err` if this event must be dropped too.
    #[doc(hidden)]
    pub fn event(&self) -> Result<u64, RateLimited> {
        self.event_at(Instant::now())
    }

    fn event_at(&self, now: Instant) -> Result<u64, RateLimited> {
        let mut state = self.state.lock();
        let expired = state
            .period_start
            .is_none_or(|start| now.saturating_duration_since(start) >= PERIOD);
        if expired {
            state.period_start = Some(now);
            state.events = 0;
        }
        if state.events >= EVENTS_PER_PERIOD {
            state.missed += 1;
            return Err(RateLimited);
        }
        state.events += 1;
        Ok(std::mem::take(&mut state.missed))
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Like [`tracing::error!`], but rate limited per call site.
#[macro_export]
macro_rules! error_ratelimited {
    ($($rest:tt)*) => {{
        static RATE_LIMITER: $crate::RateLimiter = $crate::RateLimiter::new();
        if let Ok(missed_events) = RATE_LIMITER.event() {
            $crate::tracing::error!(dropped_ratelimited = missed_events, $($rest)*);
        }
    }};
}

/// Like [`tracing::warn!`], but rate limited per call site.
#[macro_export]
macro_rules! warn_ratelimited {
    ($($rest:tt)*) => {{
        static RATE_LIMITER: $crate::RateLimiter = $crate::RateLimiter::new();
        if let Ok(missed_events) = RATE_LIMITER.event() {
            $crate::tracing::warn!(dropped_ratelimited = missed_events, $($rest)*);
        }
    }};
}

/// Like [`tracing::info!`], but rate limited per call site.
#[macro_export]
macro_rules! info_ratelimited {
    ($($rest:tt)*) => {{
        static RATE_LIMITER: $crate::RateLimiter = $crate::RateLimiter::new();
        if let Ok(missed_events) = RATE_LIMITER.event() {
            $crate::tracing::info!(dropped_ratelimited = missed_events, $($rest)*);
        }
    }};
}
