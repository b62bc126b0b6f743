//! Fixed-length counting windows with lazy rollover.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

/// A counting period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Window {
    /// Sixty seconds.
    Minute,
    /// Sixty minutes.
    Hour,
}

impl Window {
    /// Every window, in the order limits are evaluated.
    pub const ALL: [Window; 2] = [Window::Minute, Window::Hour];

    /// Length of the period.
    pub fn period(self) -> Duration {
        match self {
            Window::Minute => Duration::from_secs(60),
            Window::Hour => Duration::from_secs(3600),
        }
    }

    /// Lowercase name used in keys, logs and metric attributes.
    pub fn as_str(self) -> &'static str {
        match self {
            Window::Minute => "minute",
            Window::Hour => "hour",
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters of one identifier for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowState {
    /// Requests recorded since `window_start`.
    pub count: u64,
    /// Tokens recorded since `window_start`.
    pub tokens: u64,
    /// Start of the current period.
    pub window_start: Instant,
}

impl WindowState {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            count: 0,
            tokens: 0,
            window_start: now,
        }
    }

    /// Whether the period has elapsed at `now`.
    pub fn is_stale(&self, window: Window, now: Instant) -> bool {
        now.saturating_duration_since(self.window_start) >= window.period()
    }

    /// Starts a new period if the current one has elapsed. Returns true if the counters were reset.
    pub(crate) fn roll(&mut self, window: Window, now: Instant) -> bool {
        if !self.is_stale(window, now) {
            return false;
        }

        // `now` is never behind `window_start` here, so the start only moves forward.
        *self = Self::new(now);
        true
    }

    /// Time left until the period ends.
    pub fn retry_after(&self, window: Window, now: Instant) -> Duration {
        window
            .period()
            .saturating_sub(now.saturating_duration_since(self.window_start))
    }
}

/// Effective ceiling of a window once the burst allowance is applied.
pub fn ceiling(limit: u64, burst_multiplier: f64) -> u64 {
    (limit as f64 * burst_multiplier) as u64
}
