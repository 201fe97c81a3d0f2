//! Fault-tolerance middleware for connector operations.
//!
//! Every network-facing call a connector makes goes through one
//! [`ResilienceManager`], which wraps it with retry, circuit breaking, rate
//! limiting and best-effort recovery so that connectors never implement
//! that logic themselves.
//!
//! # Stages
//!
//! - **[`retry`]**: exponential backoff with jitter, retrying only failures
//!   classified as transient
//! - **[`circuit_breaker`]**: CLOSED / OPEN / HALF_OPEN breaker shared by
//!   every operation of a connector
//! - **[`rate_limiter`]**: token buckets with WAIT, DROP or QUEUE
//!   backpressure, globally or per key
//! - **[`recovery`]**: one extra retry cycle after a connectivity failure or
//!   a successful credential refresh
//!
//! Host errors are classified through [`ClassifyFailure`]. Clock, sleeper
//! and random source are injected, and [`testing`] provides deterministic
//! stand-ins.
//!
//! # Example
//!
//! ```rust
//! use std::io;
//!
//! use connector_resilience::{ConnectorKind, ResilienceManager};
//!
//! # tokio_test::block_on(async {
//! let manager = ResilienceManager::for_connector("warehouse", ConnectorKind::Database)?;
//!
//! let rows = manager
//!     .execute(|| async { Ok::<_, io::Error>(vec![1, 2, 3]) }, "fetch_rows", None)
//!     .await
//!     .map_err(|e| e.to_string())?;
//! assert_eq!(rows.len(), 3);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # }).unwrap();
//! ```

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used, clippy::panic))]

pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod jitter;
pub mod manager;
pub mod profiles;
pub mod rate_limiter;
pub mod recovery;
pub mod retry;
pub mod serde_utils;
pub mod testing;
pub mod time;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerMetrics, CircuitBreakerPolicy, CircuitBreakerPolicyBuilder,
    CircuitState,
};
pub use config::{PolicySetting, ResilienceConfig, ValidatePolicy};
pub use error::{
    ClassifyFailure, ConfigError, ConfigResult, FailureCategory, FailureKind, RateLimitError,
    ResilienceError,
};
pub use jitter::{JitterSource, SharedJitter, ThreadRngJitter};
pub use manager::{ResilienceManager, ResilienceManagerBuilder};
pub use profiles::{profile_for, ConnectorKind};
pub use rate_limiter::{
    BackpressureStrategy, RateLimitPolicy, RateLimitPolicyBuilder, RateLimiter, TokenBucket,
};
pub use recovery::{
    CredentialRefresher, NoopRefresher, RecoveryExecutor, RecoveryPolicy, RecoveryPolicyBuilder,
    RecoveryTracker, SharedRefresher,
};
pub use retry::{RetryExecutor, RetryPolicy, RetryPolicyBuilder};
pub use time::{Clock, SharedClock, SharedSleeper, Sleeper, SystemClock, TokioSleeper};
