//! Three-state circuit breaker guarding one remote dependency
//!
//! ```text
//!            failures >= failure_threshold
//!   CLOSED ───────────────────────────────▶ OPEN
//!     ▲                                     │  ▲
//!     │ successes >= success_threshold      │  │ any counted failure
//!     │                                     ▼  │
//!     └──────────────────────────────── HALF_OPEN
//!                 (entered lazily once recovery_timeout has
//!                  elapsed since the last failure)
//! ```
//!
//! All state lives behind one mutex, so every check-then-transition is a
//! single critical section. Clones share that state.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{
    ClassifyFailure, ConfigError, ConfigResult, FailureCategory, FailureKind, ResilienceError,
};
use crate::serde_utils::duration_millis;
use crate::time::{system_clock, SharedClock};

/// Default number of counted failures before the circuit opens
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Default time an open circuit waits before allowing a trial call
pub const DEFAULT_RECOVERY_TIMEOUT: Duration = Duration::from_secs(60);

/// Default number of half-open successes needed to close the circuit
pub const DEFAULT_SUCCESS_THRESHOLD: u32 = 2;

/// Default informational operation timeout
pub const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

fn default_excluded_kinds() -> BTreeSet<FailureCategory> {
    BTreeSet::from([FailureCategory::Validation])
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, allowing trial requests to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitBreakerPolicy {
    /// Number of counted failures before opening the circuit
    pub failure_threshold: u32,
    /// Time since the last failure before an open circuit admits a trial
    #[serde(rename = "recovery_timeout_ms", with = "duration_millis")]
    pub recovery_timeout: Duration,
    /// Number of half-open successes needed to close the circuit
    pub success_threshold: u32,
    /// Failure categories never counted against the circuit
    pub excluded_kinds: BTreeSet<FailureCategory>,
    /// Expected upper bound of a single call. Not enforced here; the wrapped
    /// operation owns its deadline.
    #[serde(rename = "timeout_ms", with = "duration_millis")]
    pub timeout: Duration,
}

impl Default for CircuitBreakerPolicy {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout: DEFAULT_RECOVERY_TIMEOUT,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
            excluded_kinds: default_excluded_kinds(),
            timeout: DEFAULT_OPERATION_TIMEOUT,
        }
    }
}

impl CircuitBreakerPolicy {
    /// Create a policy builder
    pub fn builder() -> CircuitBreakerPolicyBuilder {
        CircuitBreakerPolicyBuilder::new()
    }

    /// Validate the policy
    pub fn validate(&self) -> ConfigResult<()> {
        if self.failure_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.failure_threshold",
                "must be greater than 0",
            ));
        }
        if self.success_threshold == 0 {
            return Err(ConfigError::invalid(
                "circuit_breaker.success_threshold",
                "must be greater than 0",
            ));
        }
        Ok(())
    }

    /// Whether failures of this kind are ignored by the breaker.
    pub fn is_excluded(&self, kind: &FailureKind) -> bool {
        self.excluded_kinds.contains(&kind.category())
    }
}

/// Builder for CircuitBreakerPolicy
#[derive(Debug, Default)]
pub struct CircuitBreakerPolicyBuilder {
    policy: CircuitBreakerPolicy,
}

impl CircuitBreakerPolicyBuilder {
    /// Start from the default policy.
    pub fn new() -> Self {
        Self { policy: CircuitBreakerPolicy::default() }
    }

    /// Consecutive failures that open the circuit.
    pub fn failure_threshold(mut self, threshold: u32) -> Self {
        self.policy.failure_threshold = threshold;
        self
    }

    /// Time the circuit stays open before a trial call.
    pub fn recovery_timeout(mut self, timeout: Duration) -> Self {
        self.policy.recovery_timeout = timeout;
        self
    }

    /// Trial successes needed to close a half-open circuit.
    pub fn success_threshold(mut self, threshold: u32) -> Self {
        self.policy.success_threshold = threshold;
        self
    }

    /// Failure categories that never count toward opening.
    pub fn excluded_kinds(mut self, kinds: impl IntoIterator<Item = FailureCategory>) -> Self {
        self.policy.excluded_kinds = kinds.into_iter().collect();
        self
    }

    /// Expected upper bound of a single call.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.policy.timeout = timeout;
        self
    }

    /// Validate and return the policy.
    pub fn build(self) -> ConfigResult<CircuitBreakerPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// Circuit breaker metrics for monitoring
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerMetrics {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures counted while closed.
    pub failure_count: u32,
    /// Trial successes counted while half-open.
    pub success_count: u32,
    /// Calls admitted since creation
    pub total_calls: u64,
    /// Calls rejected by an open circuit since creation
    pub rejected_calls: u64,
    /// When the most recent counted failure happened.
    pub last_failure_time: Option<Instant>,
    /// When the breaker entered its current state.
    pub state_changed_at: Instant,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<Instant>,
    total_calls: u64,
    rejected_calls: u64,
    state_changed_at: Instant,
}

struct Inner {
    name: String,
    policy: CircuitBreakerPolicy,
    clock: SharedClock,
    state: Mutex<BreakerState>,
}

/// Circuit breaker shared by every operation of one connector.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Inner>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("policy", &self.inner.policy)
            .field("state", &state.state)
            .field("failure_count", &state.failure_count)
            .field("success_count", &state.success_count)
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a circuit breaker on the system clock.
    pub fn new(name: impl Into<String>, policy: CircuitBreakerPolicy) -> ConfigResult<Self> {
        Self::with_clock(name, policy, system_clock())
    }

    /// Create a circuit breaker with a custom clock (useful for testing)
    pub fn with_clock(
        name: impl Into<String>,
        policy: CircuitBreakerPolicy,
        clock: SharedClock,
    ) -> ConfigResult<Self> {
        policy.validate()?;
        let now = clock.now();

        Ok(Self {
            inner: Arc::new(Inner {
                name: name.into(),
                policy,
                clock,
                state: Mutex::new(BreakerState {
                    state: CircuitState::Closed,
                    failure_count: 0,
                    success_count: 0,
                    last_failure_time: None,
                    total_calls: 0,
                    rejected_calls: 0,
                    state_changed_at: now,
                }),
            }),
        })
    }

    /// Name used in log events.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Policy this breaker was built with.
    pub fn policy(&self) -> &CircuitBreakerPolicy {
        &self.inner.policy
    }

    /// Current state, without applying a due OPEN to HALF_OPEN transition.
    pub fn state(&self) -> CircuitState {
        self.inner.state.lock().state
    }

    /// Consecutive failures counted so far.
    pub fn failure_count(&self) -> u32 {
        self.inner.state.lock().failure_count
    }

    /// Trial successes counted in the half-open state.
    pub fn success_count(&self) -> u32 {
        self.inner.state.lock().success_count
    }

    /// Snapshot of the breaker's state and counters.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let state = self.inner.state.lock();
        CircuitBreakerMetrics {
            state: state.state,
            failure_count: state.failure_count,
            success_count: state.success_count,
            total_calls: state.total_calls,
            rejected_calls: state.rejected_calls,
            last_failure_time: state.last_failure_time,
            state_changed_at: state.state_changed_at,
        }
    }

    /// Admission check.
    ///
    /// Moves an open circuit to half-open when `recovery_timeout` has
    /// elapsed since the last failure. Returns false only for an open
    /// circuit.
    pub fn may_proceed(&self) -> bool {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();

        if state.state == CircuitState::Open {
            let recovered = match state.last_failure_time {
                Some(failed_at) => {
                    now.saturating_duration_since(failed_at) >= self.inner.policy.recovery_timeout
                }
                None => true,
            };
            if recovered {
                state.success_count = 0;
                self.transition(&mut state, CircuitState::HalfOpen, now);
            }
        }

        if state.state == CircuitState::Open {
            state.rejected_calls += 1;
            debug!(breaker = %self.inner.name, "circuit open, rejecting call");
            false
        } else {
            state.total_calls += 1;
            true
        }
    }

    /// Record a successful call.
    pub fn on_success(&self) {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();

        match state.state {
            CircuitState::Closed => {
                state.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.inner.policy.success_threshold {
                    state.failure_count = 0;
                    state.success_count = 0;
                    self.transition(&mut state, CircuitState::Closed, now);
                }
            }
            CircuitState::Open => {
                debug!(breaker = %self.inner.name, "ignoring success while circuit is open");
            }
        }
    }

    /// Record a failed call. Excluded kinds leave the breaker untouched.
    pub fn on_failure(&self, kind: &FailureKind) {
        if self.inner.policy.is_excluded(kind) {
            debug!(breaker = %self.inner.name, kind = %kind, "failure kind excluded from circuit");
            return;
        }

        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();
        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure_time = Some(now);

        match state.state {
            CircuitState::Closed => {
                if state.failure_count >= self.inner.policy.failure_threshold {
                    self.transition(&mut state, CircuitState::Open, now);
                }
            }
            CircuitState::HalfOpen => {
                state.success_count = 0;
                self.transition(&mut state, CircuitState::Open, now);
            }
            CircuitState::Open => {}
        }
    }

    /// Force the circuit back to CLOSED with zeroed counters.
    pub fn reset(&self) {
        let now = self.inner.clock.now();
        let mut state = self.inner.state.lock();
        state.failure_count = 0;
        state.success_count = 0;
        state.last_failure_time = None;
        if state.state != CircuitState::Closed {
            self.transition(&mut state, CircuitState::Closed, now);
        }
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// An open circuit fails with [`ResilienceError::CircuitOpen`] without
    /// invoking the operation.
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ClassifyFailure + std::error::Error + Send + Sync + 'static,
    {
        if !self.may_proceed() {
            return Err(self.open_error());
        }

        match operation().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(error) => {
                self.on_failure(&error.failure_kind());
                Err(ResilienceError::Operation(error))
            }
        }
    }

    pub(crate) fn open_error<E>(&self) -> ResilienceError<E>
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ResilienceError::CircuitOpen { name: self.inner.name.clone() }
    }

    fn transition(&self, state: &mut BreakerState, to: CircuitState, now: Instant) {
        let from = state.state;
        state.state = to;
        state.state_changed_at = now;
        info!(
            breaker = %self.inner.name,
            from = %from,
            to = %to,
            failure_count = state.failure_count,
            "circuit state transition"
        );
    }
}

#[cfg(test)]
mod tests {
    //! Unit tests for the circuit breaker
    //!
    //! Tests cover policy validation, the full CLOSED/OPEN/HALF_OPEN cycle,
    //! excluded failure kinds and metrics.

    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::testing::{MockClock, TestFailure};
    use crate::time::Clock;

    fn breaker(failures: u32, successes: u32, clock: &MockClock) -> CircuitBreaker {
        let policy = CircuitBreakerPolicy::builder()
            .failure_threshold(failures)
            .success_threshold(successes)
            .recovery_timeout(Duration::from_secs(60))
            .build()
            .unwrap();
        CircuitBreaker::with_clock("test", policy, Arc::new(clock.clone())).unwrap()
    }

    #[test]
    fn test_policy_default() {
        let policy = CircuitBreakerPolicy::default();
        assert_eq!(policy.failure_threshold, 5);
        assert_eq!(policy.recovery_timeout, Duration::from_secs(60));
        assert_eq!(policy.success_threshold, 2);
        assert_eq!(policy.timeout, Duration::from_secs(30));
        assert!(policy.is_excluded(&FailureKind::Validation));
        assert!(!policy.is_excluded(&FailureKind::Timeout));
    }

    #[test]
    fn test_policy_validation() {
        assert!(CircuitBreakerPolicy::builder().failure_threshold(0).build().is_err());
        assert!(CircuitBreakerPolicy::builder().success_threshold(0).build().is_err());
        assert!(CircuitBreakerPolicy::builder().failure_threshold(1).build().is_ok());
    }

    #[test]
    fn test_circuit_state_display() {
        assert_eq!(CircuitState::Closed.to_string(), "CLOSED");
        assert_eq!(CircuitState::Open.to_string(), "OPEN");
        assert_eq!(CircuitState::HalfOpen.to_string(), "HALF_OPEN");
    }

    /// Validates the circuit opens exactly at the failure threshold.
    #[test]
    fn test_opens_at_threshold() {
        let clock = MockClock::new();
        let cb = breaker(3, 1, &clock);

        cb.on_failure(&FailureKind::Connectivity);
        cb.on_failure(&FailureKind::Connectivity);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.may_proceed());

        cb.on_failure(&FailureKind::Connectivity);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.may_proceed());
    }

    #[test]
    fn test_success_resets_failures_when_closed() {
        let clock = MockClock::new();
        let cb = breaker(3, 1, &clock);

        cb.on_failure(&FailureKind::Timeout);
        cb.on_failure(&FailureKind::Timeout);
        cb.on_success();
        assert_eq!(cb.failure_count(), 0);

        cb.on_failure(&FailureKind::Timeout);
        cb.on_failure(&FailureKind::Timeout);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    /// Validates the open circuit becomes half-open only once the recovery
    /// timeout has elapsed since the last failure.
    #[test]
    fn test_half_open_after_recovery_timeout() {
        let clock = MockClock::new();
        let cb = breaker(1, 2, &clock);

        cb.on_failure(&FailureKind::Connectivity);
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(59));
        assert!(!cb.may_proceed());
        assert_eq!(cb.state(), CircuitState::Open);

        clock.advance(Duration::from_secs(1));
        assert!(cb.may_proceed());
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_closes_after_success_threshold() {
        let clock = MockClock::new();
        let cb = breaker(1, 2, &clock);

        cb.on_failure(&FailureKind::Connectivity);
        clock.advance(Duration::from_secs(60));
        assert!(cb.may_proceed());

        cb.on_success();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.success_count(), 1);

        cb.on_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert_eq!(cb.success_count(), 0);
    }

    #[test]
    fn test_half_open_failure_reopens() {
        let clock = MockClock::new();
        let cb = breaker(2, 2, &clock);

        cb.on_failure(&FailureKind::Connectivity);
        cb.on_failure(&FailureKind::Connectivity);
        clock.advance(Duration::from_secs(60));
        assert!(cb.may_proceed());
        cb.on_success();

        cb.on_failure(&FailureKind::Status(503));
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.may_proceed());

        // The recovery timeout restarts from the reopening failure.
        clock.advance(Duration::from_secs(30));
        assert!(!cb.may_proceed());
        clock.advance(Duration::from_secs(30));
        assert!(cb.may_proceed());
        assert_eq!(cb.success_count(), 0);
    }

    #[test]
    fn test_excluded_kinds_are_inert() {
        let clock = MockClock::new();
        let cb = breaker(1, 1, &clock);

        for _ in 0..10 {
            cb.on_failure(&FailureKind::Validation);
        }
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.metrics().last_failure_time.is_none());

        cb.on_failure(&FailureKind::Connectivity);
        clock.advance(Duration::from_secs(60));
        assert!(cb.may_proceed());
        cb.on_failure(&FailureKind::Validation);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_success_while_open_is_ignored() {
        let clock = MockClock::new();
        let cb = breaker(1, 1, &clock);

        cb.on_failure(&FailureKind::Connectivity);
        cb.on_success();
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.failure_count(), 1);
    }

    #[test]
    fn test_reset() {
        let clock = MockClock::new();
        let cb = breaker(1, 1, &clock);

        cb.on_failure(&FailureKind::Connectivity);
        cb.reset();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
        assert!(cb.may_proceed());
    }

    #[test]
    fn test_metrics_counts_admissions_and_rejections() {
        let clock = MockClock::new();
        let cb = breaker(1, 1, &clock);

        assert!(cb.may_proceed());
        cb.on_failure(&FailureKind::Connectivity);
        assert!(!cb.may_proceed());
        assert!(!cb.may_proceed());

        let metrics = cb.metrics();
        assert_eq!(metrics.state, CircuitState::Open);
        assert_eq!(metrics.total_calls, 1);
        assert_eq!(metrics.rejected_calls, 2);
        assert_eq!(metrics.failure_count, 1);
        assert_eq!(metrics.last_failure_time, Some(clock.now()));
    }

    #[test]
    fn test_clones_share_state() {
        let clock = MockClock::new();
        let cb = breaker(1, 1, &clock);
        let other = cb.clone();

        other.on_failure(&FailureKind::Connectivity);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn test_execute_rejects_without_invoking() {
        let clock = MockClock::new();
        let cb = breaker(2, 1, &clock);
        let calls = AtomicU32::new(0);

        for _ in 0..2 {
            let result: Result<(), _> = cb
                .execute(|| async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(TestFailure::connectivity())
                })
                .await;
            assert!(matches!(result, Err(ResilienceError::Operation(_))));
        }

        let result: Result<(), ResilienceError<TestFailure>> = cb
            .execute(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        match result {
            Err(ResilienceError::CircuitOpen { name }) => assert_eq!(name, "test"),
            other => panic!("expected CircuitOpen, got {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_execute_success_passes_value_through() {
        let clock = MockClock::new();
        let cb = breaker(2, 1, &clock);

        let result: Result<u32, ResilienceError<TestFailure>> =
            cb.execute(|| async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(cb.metrics().total_calls, 1);
    }

    /// Validates that concurrent failures cross the threshold exactly once.
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_failures() {
        let clock = MockClock::new();
        let cb = breaker(50, 1, &clock);

        let handles: Vec<_> = (0..100)
            .map(|_| {
                let cb = cb.clone();
                tokio::spawn(async move { cb.on_failure(&FailureKind::Connectivity) })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.failure_count(), 100);
    }
}
