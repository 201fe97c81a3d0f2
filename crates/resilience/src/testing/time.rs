//! Deterministic time for tests
//!
//! [`MockClock`] only moves when told to. [`MockSleeper`] records every
//! requested pause and advances its clock by the same amount, so code that
//! sleeps and then reads the clock observes exactly the time it asked for.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::time::{Clock, Sleeper};

/// Mock clock for deterministic testing
///
/// Clones share the same elapsed time.
#[derive(Debug, Clone)]
pub struct MockClock {
    start: Instant,
    elapsed: Arc<Mutex<Duration>>,
}

impl MockClock {
    /// Create a new mock clock starting at the current instant
    pub fn new() -> Self {
        Self::with_current_time(Instant::now())
    }

    /// Create a new mock clock with a specific start time
    pub fn with_current_time(start: Instant) -> Self {
        Self { start, elapsed: Arc::new(Mutex::new(Duration::ZERO)) }
    }

    /// Advance the mock clock by a duration
    pub fn advance(&self, duration: Duration) {
        let mut elapsed = self.elapsed.lock();
        *elapsed = elapsed.saturating_add(duration);
    }

    /// Advance the mock clock by milliseconds (convenience method)
    pub fn advance_millis(&self, millis: u64) {
        self.advance(Duration::from_millis(millis));
    }

    /// Set the mock clock to a specific elapsed time
    pub fn set_elapsed(&self, duration: Duration) {
        *self.elapsed.lock() = duration;
    }

    /// Get the current elapsed time
    pub fn elapsed(&self) -> Duration {
        *self.elapsed.lock()
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MockClock {
    fn now(&self) -> Instant {
        self.start + self.elapsed()
    }
}

/// Sleeper that records delays and advances a [`MockClock`] instead of
/// waiting.
///
/// Each sleep still yields once to the runtime so concurrent tasks
/// interleave the way they would with a real timer.
#[derive(Debug, Clone)]
pub struct MockSleeper {
    clock: MockClock,
    recorded: Arc<Mutex<Vec<Duration>>>,
}

impl MockSleeper {
    /// Sleeper that advances `clock` by every delay.
    pub fn new(clock: MockClock) -> Self {
        Self { clock, recorded: Arc::new(Mutex::new(Vec::new())) }
    }

    /// The clock this sleeper advances.
    pub fn clock(&self) -> &MockClock {
        &self.clock
    }

    /// Every delay requested so far, in order.
    pub fn recorded(&self) -> Vec<Duration> {
        self.recorded.lock().clone()
    }

    /// Number of sleeps requested so far.
    pub fn count(&self) -> usize {
        self.recorded.lock().len()
    }

    /// Sum of all requested delays.
    pub fn total(&self) -> Duration {
        self.recorded.lock().iter().fold(Duration::ZERO, |acc, d| acc.saturating_add(*d))
    }
}

#[async_trait]
impl Sleeper for MockSleeper {
    async fn sleep(&self, duration: Duration) {
        self.recorded.lock().push(duration);
        self.clock.advance(duration);
        tokio::task::yield_now().await;
    }
}
