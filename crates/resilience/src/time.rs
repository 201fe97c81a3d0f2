//! Time abstraction for testability
//!
//! Every elapsed-time computation in this crate (circuit recovery timeout,
//! token refill) reads a [`Clock`], and every pause (retry backoff,
//! rate-limit wait, recovery check interval) goes through a [`Sleeper`].
//! Production code uses [`SystemClock`] and [`TokioSleeper`]; tests swap in
//! [`crate::testing::MockClock`] and [`crate::testing::MockSleeper`] so that
//! no test waits on the wall clock.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

/// Monotonic time source.
pub trait Clock: Send + Sync + 'static {
    /// Get current instant (monotonic time)
    fn now(&self) -> Instant;

    /// Time elapsed since `earlier`, saturating at zero.
    fn elapsed_since(&self, earlier: Instant) -> Duration {
        self.now().saturating_duration_since(earlier)
    }
}

/// Real system clock implementation for production use
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Implement Clock for Arc<T> where T: Clock for convenient cloning
impl<T: Clock> Clock for Arc<T> {
    fn now(&self) -> Instant {
        (**self).now()
    }
}

/// Shared clock handle used by every stateful component.
pub type SharedClock = Arc<dyn Clock>;

/// Delay primitive used between attempts.
///
/// Implementations must suspend the calling task rather than block the
/// worker thread.
#[async_trait]
pub trait Sleeper: Send + Sync + 'static {
    /// Suspend the current task for `duration`.
    async fn sleep(&self, duration: Duration);
}

/// Sleeper backed by `tokio::time::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Shared sleeper handle used by every component that pauses.
pub type SharedSleeper = Arc<dyn Sleeper>;

pub(crate) fn system_clock() -> SharedClock {
    Arc::new(SystemClock)
}

pub(crate) fn tokio_sleeper() -> SharedSleeper {
    Arc::new(TokioSleeper)
}
