//! Mock implementations of the pipeline's collaborators
//!
//! Provides a pinned random source, a classifiable error type, a counting
//! credential refresher and a scripted operation.

#![allow(clippy::missing_panics_doc)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::error::{ClassifyFailure, FailureKind};
use crate::jitter::JitterSource;
use crate::recovery::CredentialRefresher;

/// Jitter source that always returns the same value, clamped to the
/// requested range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FixedJitter(f64);

impl FixedJitter {
    /// Always sample `value`, clamped to the requested range.
    pub fn new(value: f64) -> Self {
        Self(value)
    }
}

impl JitterSource for FixedJitter {
    fn sample(&self, low: f64, high: f64) -> f64 {
        self.0.clamp(low, high.max(low))
    }
}

/// Operation error carrying an explicit [`FailureKind`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct TestFailure {
    kind: FailureKind,
    message: String,
}

impl TestFailure {
    /// Failure of `kind` with a display message.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    /// Connection refused.
    pub fn connectivity() -> Self {
        Self::new(FailureKind::Connectivity, "connection refused")
    }

    /// Request timed out.
    pub fn timeout() -> Self {
        Self::new(FailureKind::Timeout, "operation timed out")
    }

    /// HTTP status failure.
    pub fn status(code: u16) -> Self {
        Self::new(FailureKind::Status(code), format!("HTTP {code}"))
    }

    /// HTTP 401.
    pub fn unauthorized() -> Self {
        Self::status(FailureKind::UNAUTHORIZED)
    }

    /// Provider-specific error code.
    pub fn provider(code: &str) -> Self {
        Self::new(FailureKind::Provider(code.to_string()), format!("provider error {code}"))
    }

    /// Rejected input.
    pub fn validation() -> Self {
        Self::new(FailureKind::Validation, "invalid parameter")
    }

    /// Unclassified failure.
    pub fn other() -> Self {
        Self::new(FailureKind::Other, "unclassified failure")
    }

    /// Classification of this failure.
    pub fn kind(&self) -> &FailureKind {
        &self.kind
    }
}

impl ClassifyFailure for TestFailure {
    fn failure_kind(&self) -> FailureKind {
        self.kind.clone()
    }
}

/// Credential refresher returning a fixed result and counting its calls.
#[derive(Debug)]
pub struct CountingRefresher {
    result: bool,
    calls: AtomicU32,
}

impl CountingRefresher {
    /// Refresher that always reports `result`.
    pub fn new(result: bool) -> Self {
        Self { result, calls: AtomicU32::new(0) }
    }

    /// Number of refresh calls so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialRefresher for CountingRefresher {
    async fn refresh(&self, _operation_name: &str) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result
    }
}

/// Operation that plays back a fixed sequence of outcomes.
///
/// Once the script runs out the last outcome repeats. Successful calls
/// return their 1-based invocation number. Clones share the script and the
/// call count.
#[derive(Debug, Clone)]
pub struct OperationScript {
    outcomes: Arc<Mutex<VecDeque<Result<(), TestFailure>>>>,
    last: Arc<Mutex<Result<(), TestFailure>>>,
    calls: Arc<AtomicU32>,
}

impl OperationScript {
    /// Play back `outcomes` in order.
    pub fn new(outcomes: impl IntoIterator<Item = Result<(), TestFailure>>) -> Self {
        Self {
            outcomes: Arc::new(Mutex::new(outcomes.into_iter().collect())),
            last: Arc::new(Mutex::new(Ok(()))),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Fail with each of `failures` in turn, then succeed.
    pub fn failing_then_ok(failures: impl IntoIterator<Item = TestFailure>) -> Self {
        Self::new(failures.into_iter().map(Err).chain(std::iter::once(Ok(()))))
    }

    /// Fail with `failure` on every call.
    pub fn always_failing(failure: TestFailure) -> Self {
        Self::new([Err(failure)])
    }

    /// Run the next scripted outcome.
    pub async fn call(&self) -> Result<u32, TestFailure> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let outcome = match self.outcomes.lock().pop_front() {
            Some(outcome) => {
                *self.last.lock() = outcome.clone();
                outcome
            }
            None => self.last.lock().clone(),
        };
        tokio::task::yield_now().await;
        outcome.map(|()| call)
    }

    /// Number of invocations so far.
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}
