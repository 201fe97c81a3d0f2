//! Testing utilities and helpers
//!
//! - **[`time`]**: [`MockClock`] and [`MockSleeper`] for deterministic time
//! - **[`mocks`]**: [`FixedJitter`], [`TestFailure`], [`OperationScript`] and
//!   [`CountingRefresher`] stand-ins for the pipeline's collaborators
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use connector_resilience::testing::{MockClock, MockSleeper};
//! use connector_resilience::Sleeper;
//!
//! # tokio_test::block_on(async {
//! let clock = MockClock::new();
//! let sleeper = MockSleeper::new(clock.clone());
//!
//! sleeper.sleep(Duration::from_secs(5)).await;
//! assert_eq!(clock.elapsed(), Duration::from_secs(5));
//! assert_eq!(sleeper.recorded(), vec![Duration::from_secs(5)]);
//! # });
//! ```

pub mod mocks;
pub mod time;

pub use mocks::{CountingRefresher, FixedJitter, OperationScript, TestFailure};
pub use time::{MockClock, MockSleeper};

/// Install a `tracing` subscriber that honours `RUST_LOG` and writes
/// through the test harness's captured output. Safe to call repeatedly.
#[cfg(any(test, feature = "test-utils"))]
pub fn init_test_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
