//! Retry with exponential backoff and jitter
//!
//! [`RetryExecutor`] runs an operation up to `max_attempts` times. Between
//! attempts it pauses for
//!
//! ```text
//! base  = min(initial_delay * backoff_multiplier ^ attempt_index, max_delay)
//! delay = base * (1 + U(-0.1, 0.1))      (when jitter is enabled)
//! ```
//!
//! clamped to `[0, max_delay]`. Only failures the policy designates as
//! retryable are retried; everything else propagates on the first failure.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::error::{ClassifyFailure, ConfigError, ConfigResult, FailureCategory, FailureKind};
use crate::jitter::{thread_rng_jitter, SharedJitter};
use crate::serde_utils::duration_millis;
use crate::time::{tokio_sleeper, SharedSleeper};

/// Default maximum number of attempts
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the first retry
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_secs(1);

/// Default maximum delay cap
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

/// Default exponential backoff multiplier
pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Relative spread applied to a delay when jitter is enabled
pub const JITTER_SPREAD: f64 = 0.1;

/// Cloud-provider error codes that signal throttling, internal errors or
/// server-side timeouts and are therefore worth retrying.
pub const RETRYABLE_PROVIDER_CODES: &[&str] = &[
    // Throttling
    "Throttling",
    "ThrottlingException",
    "ThrottledException",
    "RequestThrottledException",
    "RequestThrottled",
    "TooManyRequestsException",
    "ProvisionedThroughputExceededException",
    "RequestLimitExceeded",
    "BandwidthLimitExceeded",
    "LimitExceededException",
    "SlowDown",
    "rateLimitExceeded",
    "userRateLimitExceeded",
    // Internal errors
    "InternalError",
    "InternalFailure",
    "InternalServerError",
    "ServiceUnavailable",
    "ServiceUnavailableException",
    "backendError",
    // Timeouts
    "RequestTimeout",
    "RequestTimeoutException",
    "PriorRequestNotComplete",
];

fn default_retryable_kinds() -> BTreeSet<FailureCategory> {
    BTreeSet::from([FailureCategory::Connectivity, FailureCategory::Timeout])
}

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(rename = "initial_delay_ms", with = "duration_millis")]
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    #[serde(rename = "max_delay_ms", with = "duration_millis")]
    pub max_delay: Duration,
    /// Growth factor applied per attempt
    pub backoff_multiplier: f64,
    /// Whether to spread delays by ±10%
    pub jitter: bool,
    /// Failure categories retried when no status/provider rule applies
    pub retryable_kinds: BTreeSet<FailureCategory>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_delay: DEFAULT_INITIAL_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter: true,
            retryable_kinds: default_retryable_kinds(),
        }
    }
}

impl RetryPolicy {
    /// Create a policy builder
    pub fn builder() -> RetryPolicyBuilder {
        RetryPolicyBuilder::new()
    }

    /// Validate the policy
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.max_attempts", "must be at least 1"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "retry.backoff_multiplier",
                format!("must be a finite value >= 1.0, got {}", self.backoff_multiplier),
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(ConfigError::invalid(
                "retry.initial_delay",
                format!(
                    "initial_delay ({:?}) cannot be greater than max_delay ({:?})",
                    self.initial_delay, self.max_delay
                ),
            ));
        }
        Ok(())
    }
}

/// Builder for RetryPolicy with fluent API
#[derive(Debug, Default)]
pub struct RetryPolicyBuilder {
    policy: RetryPolicy,
}

impl RetryPolicyBuilder {
    /// Start from the default policy.
    pub fn new() -> Self {
        Self { policy: RetryPolicy::default() }
    }

    /// Total attempts, including the first.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    /// Delay before the first retry.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.policy.initial_delay = delay;
        self
    }

    /// Upper bound on any single delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.policy.max_delay = delay;
        self
    }

    /// Growth factor applied per attempt.
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.policy.backoff_multiplier = multiplier;
        self
    }

    /// Spread delays by up to ±10%.
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.policy.jitter = enabled;
        self
    }

    /// Replace the set of retryable failure categories.
    pub fn retryable_kinds(mut self, kinds: impl IntoIterator<Item = FailureCategory>) -> Self {
        self.policy.retryable_kinds = kinds.into_iter().collect();
        self
    }

    /// Add one retryable failure category.
    pub fn retry_on(mut self, kind: FailureCategory) -> Self {
        self.policy.retryable_kinds.insert(kind);
        self
    }

    /// Validate and return the policy.
    pub fn build(self) -> ConfigResult<RetryPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// Runs operations with retry, backoff and jitter.
pub struct RetryExecutor {
    policy: RetryPolicy,
    sleeper: SharedSleeper,
    jitter: SharedJitter,
}

impl fmt::Debug for RetryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryExecutor").field("policy", &self.policy).finish_non_exhaustive()
    }
}

impl RetryExecutor {
    /// Create an executor that sleeps on tokio and draws jitter from the
    /// thread RNG.
    pub fn new(policy: RetryPolicy) -> ConfigResult<Self> {
        Self::with_runtime(policy, tokio_sleeper(), thread_rng_jitter())
    }

    /// Create an executor with an injected sleeper and random source.
    pub fn with_runtime(
        policy: RetryPolicy,
        sleeper: SharedSleeper,
        jitter: SharedJitter,
    ) -> ConfigResult<Self> {
        policy.validate()?;
        Ok(Self { policy, sleeper, jitter })
    }

    /// Policy this executor was built with.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Decide whether a failure on (1-based) `attempt_number` is retried.
    pub fn should_retry<E>(&self, error: &E, attempt_number: u32) -> bool
    where
        E: ClassifyFailure + ?Sized,
    {
        if attempt_number >= self.policy.max_attempts {
            return false;
        }
        self.is_retryable(&error.failure_kind())
    }

    /// Whether a failure kind is retryable under this policy, ignoring the
    /// attempt budget.
    pub fn is_retryable(&self, kind: &FailureKind) -> bool {
        match kind {
            FailureKind::Status(status) => (500..=599).contains(status),
            FailureKind::Provider(code) => RETRYABLE_PROVIDER_CODES.contains(&code.as_str()),
            other => self.policy.retryable_kinds.contains(&other.category()),
        }
    }

    /// Delay before the retry that follows the (0-based) `attempt_index`.
    pub fn compute_delay(&self, attempt_index: u32) -> Duration {
        let max_secs = self.policy.max_delay.as_secs_f64();
        let exponent = i32::try_from(attempt_index).unwrap_or(i32::MAX);
        let raw = self.policy.initial_delay.as_secs_f64()
            * self.policy.backoff_multiplier.powi(exponent);
        let base = if raw.is_finite() { raw.min(max_secs) } else { max_secs };

        let delay = if self.policy.jitter {
            base * (1.0 + self.jitter.sample(-JITTER_SPREAD, JITTER_SPREAD))
        } else {
            base
        };

        Duration::try_from_secs_f64(delay.clamp(0.0, max_secs)).unwrap_or(self.policy.max_delay)
    }

    /// Execute an operation with retry logic
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ClassifyFailure + fmt::Display,
    {
        self.execute_named("operation", operation).await
    }

    /// Execute an operation with retry logic, tagging log events with
    /// `operation_name`.
    pub async fn execute_named<F, Fut, T, E>(
        &self,
        operation_name: &str,
        mut operation: F,
    ) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ClassifyFailure + fmt::Display,
    {
        let max_attempts = self.policy.max_attempts;
        let mut attempt_index: u32 = 0;

        loop {
            let attempt_number = attempt_index + 1;
            debug!(operation = operation_name, attempt = attempt_number, max_attempts, "executing");

            let error = match operation().await {
                Ok(value) => {
                    if attempt_index > 0 {
                        debug!(
                            operation = operation_name,
                            retries = attempt_index,
                            "operation succeeded after retries"
                        );
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if !self.should_retry(&error, attempt_number) {
                let kind = error.failure_kind();
                if attempt_number >= max_attempts {
                    error!(
                        operation = operation_name,
                        attempts = attempt_number,
                        kind = %kind,
                        error = %error,
                        "operation failed after exhausting retries"
                    );
                } else {
                    error!(
                        operation = operation_name,
                        attempts = attempt_number,
                        kind = %kind,
                        error = %error,
                        "operation failed with non-retryable error"
                    );
                }
                return Err(error);
            }

            let delay = self.compute_delay(attempt_index);
            warn!(
                operation = operation_name,
                attempt = attempt_number,
                max_attempts,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "operation failed, retrying"
            );
            self.sleeper.sleep(delay).await;
            attempt_index += 1;
        }
    }
}
