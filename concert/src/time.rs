//! Time provider abstraction.
//!
//! Every protocol clock (keep-alives, timeouts, purge windows, retry
//! intervals) reads time through [`TimeProvider`], so tests can drive the
//! protocol with a [`ManualTimeProvider`] instead of the wall clock.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Provider trait for reading the current time.
///
/// `now()` returns the elapsed time since the provider was created. Values
/// are only comparable between readings of the same provider.
pub trait TimeProvider: Send + Sync {
    /// Get the current time.
    fn now(&self) -> Duration;
}

/// Shared handle to a time provider.
pub type SharedTime = Arc<dyn TimeProvider>;

/// Real time provider backed by [`Instant`].
#[derive(Debug, Clone)]
pub struct SystemTimeProvider {
    /// Start time for calculating elapsed duration
    start_time: Instant,
}

impl SystemTimeProvider {
    /// Create a new wall-clock provider.
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }
}

impl Default for SystemTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeProvider for SystemTimeProvider {
    fn now(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Manually advanced clock for deterministic tests.
///
/// Clones share the same underlying time.
///
/// ```
/// use concert::{ManualTimeProvider, TimeProvider};
/// use std::time::Duration;
///
/// let time = ManualTimeProvider::new();
/// time.advance(Duration::from_secs(2));
/// assert_eq!(time.now(), Duration::from_secs(2));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ManualTimeProvider {
    now: Arc<Mutex<Duration>>,
}

impl ManualTimeProvider {
    /// Create a clock starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().expect("Failed to lock manual clock");
        *now += delta;
    }

    /// Set the clock to an absolute value.
    pub fn set(&self, value: Duration) {
        *self.now.lock().expect("Failed to lock manual clock") = value;
    }
}

impl TimeProvider for ManualTimeProvider {
    fn now(&self) -> Duration {
        *self.now.lock().expect("Failed to lock manual clock")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_is_shared_between_clones() {
        let time = ManualTimeProvider::new();
        let other = time.clone();
        time.advance(Duration::from_millis(250));
        assert_eq!(other.now(), Duration::from_millis(250));
        other.set(Duration::from_secs(9));
        assert_eq!(time.now(), Duration::from_secs(9));
    }

    #[test]
    fn test_system_clock_is_monotonic() {
        let time = SystemTimeProvider::new();
        let a = time.now();
        let b = time.now();
        assert!(b >= a);
    }
}
