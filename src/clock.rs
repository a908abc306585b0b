//! Time source for cache expiry and hit tracking.
//!
//! ## Responsibility
//! Abstract "now" so cache TTL checks and last-hit bookkeeping can be driven
//! deterministically in tests.
//!
//! ## Guarantees
//! - [`SystemClock`] is monotonic (backed by [`Instant`]).
//! - [`ManualClock`] only moves when [`ManualClock::advance`] is called.
//!
//! ## NOT Responsible For
//! - Wall-clock timestamps on collected metrics (owned by the plugin)

use std::fmt;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// A source of monotonic time.
pub trait Clock: Send + Sync + fmt::Debug {
    /// Return the current instant.
    fn now(&self) -> Instant;
}

/// Clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only advances when told to.
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use telemetry_plugin_pool::clock::{Clock, ManualClock};
///
/// let clock = ManualClock::new();
/// let t0 = clock.now();
/// clock.advance(Duration::from_millis(250));
/// assert_eq!(clock.now() - t0, Duration::from_millis(250));
/// ```
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    /// Create a clock frozen at the current instant.
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }

    /// Instant at which the clock was created; useful to build fixed
    /// timestamps (`clock.base() + n`).
    pub fn base(&self) -> Instant {
        self.base
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let offset = *self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        self.base + offset
    }
}
