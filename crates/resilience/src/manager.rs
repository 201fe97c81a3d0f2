//! Composition root for the resilience pipeline
//!
//! [`ResilienceManager::execute`] nests the stages, outermost first:
//!
//! ```text
//! retry ─▶ circuit breaker ─▶ rate limiter ─▶ operation
//! ```
//!
//! Every attempt checks the breaker first, so an open circuit fails without
//! consuming a rate-limit token or invoking the operation. When the retry
//! loop gives up, the recovery executor may grant exactly one more full
//! retry cycle. Disabled stages are simply absent from the call path.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerPolicy};
use crate::config::{PolicySetting, ResilienceConfig};
use crate::error::{ClassifyFailure, ConfigResult, ResilienceError};
use crate::jitter::{thread_rng_jitter, JitterSource, SharedJitter};
use crate::profiles::{profile_for, ConnectorKind};
use crate::rate_limiter::{RateLimitPolicy, RateLimiter};
use crate::recovery::{RecoveryExecutor, RecoveryPolicy, SharedRefresher};
use crate::retry::{RetryExecutor, RetryPolicy};
use crate::time::{system_clock, tokio_sleeper, Clock, SharedClock, SharedSleeper, Sleeper};

/// One connector's resilience pipeline.
///
/// Owns one instance of each enabled stage for the lifetime of the
/// connector. The circuit breaker and the recovery tracker are shared by
/// every operation the connector runs.
pub struct ResilienceManager {
    name: String,
    retry: Option<RetryExecutor>,
    circuit_breaker: Option<CircuitBreaker>,
    rate_limiter: Option<RateLimiter>,
    recovery: Option<RecoveryExecutor>,
}

impl fmt::Debug for ResilienceManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceManager")
            .field("name", &self.name)
            .field("retry", &self.retry)
            .field("circuit_breaker", &self.circuit_breaker)
            .field("rate_limiter", &self.rate_limiter)
            .field("recovery", &self.recovery)
            .finish()
    }
}

impl ResilienceManager {
    /// Create a manager builder
    pub fn builder(name: impl Into<String>) -> ResilienceManagerBuilder {
        ResilienceManagerBuilder::new(name)
    }

    /// Create a manager with every stage at its defaults.
    pub fn new(name: impl Into<String>) -> ConfigResult<Self> {
        Self::builder(name).build()
    }

    /// Create a manager from a configuration section.
    pub fn from_config(name: impl Into<String>, config: &ResilienceConfig) -> ConfigResult<Self> {
        Self::builder(name).config(config.clone()).build()
    }

    /// Create a manager from a connector kind's preset.
    pub fn for_connector(name: impl Into<String>, kind: ConnectorKind) -> ConfigResult<Self> {
        Self::builder(name).config(profile_for(kind)).build()
    }

    /// Manager name, attached to every log event.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Retry stage, if enabled.
    pub fn retry(&self) -> Option<&RetryExecutor> {
        self.retry.as_ref()
    }

    /// Circuit breaker stage, if enabled.
    pub fn circuit_breaker(&self) -> Option<&CircuitBreaker> {
        self.circuit_breaker.as_ref()
    }

    /// Rate limiter stage, if enabled.
    pub fn rate_limiter(&self) -> Option<&RateLimiter> {
        self.rate_limiter.as_ref()
    }

    /// Recovery stage, if enabled.
    pub fn recovery(&self) -> Option<&RecoveryExecutor> {
        self.recovery.as_ref()
    }

    /// Run `operation` through every enabled stage.
    ///
    /// `operation_name` scopes recovery attempts and tags log events;
    /// `rate_limit_key` selects the bucket when the limiter is per-key.
    /// Operation failures come back as [`ResilienceError::Operation`]
    /// carrying the error of the last attempt of the first retry cycle.
    /// When recovery grants an extra cycle and that cycle fails too, the
    /// first cycle's error is still the one returned.
    #[instrument(
        skip_all,
        fields(manager = %self.name, operation = operation_name, key = rate_limit_key)
    )]
    pub async fn execute<F, Fut, T, E>(
        &self,
        operation: F,
        operation_name: &str,
        rate_limit_key: Option<&str>,
    ) -> Result<T, ResilienceError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ClassifyFailure + std::error::Error + Send + Sync + 'static,
    {
        let operation = &operation;

        let error = match self.retry_cycle(operation, operation_name, rate_limit_key).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        let Some(recovery) = &self.recovery else {
            return Err(error);
        };
        if !recovery.attempt_recovery(operation_name, &error.failure_kind()).await {
            return Err(error);
        }

        info!(operation = operation_name, "recovery granted, running one more retry cycle");
        match self.retry_cycle(operation, operation_name, rate_limit_key).await {
            Ok(value) => Ok(value),
            Err(retry_error) => {
                debug!(
                    operation = operation_name,
                    error = %retry_error,
                    "recovery cycle failed, returning the original error"
                );
                Err(error)
            }
        }
    }

    async fn retry_cycle<F, Fut, T, E>(
        &self,
        operation: &F,
        operation_name: &str,
        rate_limit_key: Option<&str>,
    ) -> Result<T, ResilienceError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ClassifyFailure + std::error::Error + Send + Sync + 'static,
    {
        match &self.retry {
            Some(retry) => {
                retry
                    .execute_named(operation_name, || {
                        self.guarded_attempt(operation, rate_limit_key)
                    })
                    .await
            }
            None => self.guarded_attempt(operation, rate_limit_key).await,
        }
    }

    /// One attempt: breaker admission, then a rate-limit token, then the
    /// operation, with the outcome reported back to the breaker.
    async fn guarded_attempt<F, Fut, T, E>(
        &self,
        operation: &F,
        rate_limit_key: Option<&str>,
    ) -> Result<T, ResilienceError<E>>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: ClassifyFailure + std::error::Error + Send + Sync + 'static,
    {
        if let Some(breaker) = &self.circuit_breaker {
            if !breaker.may_proceed() {
                return Err(breaker.open_error());
            }
        }

        if let Some(limiter) = &self.rate_limiter {
            limiter.acquire(rate_limit_key).await?;
        }

        match operation().await {
            Ok(value) => {
                if let Some(breaker) = &self.circuit_breaker {
                    breaker.on_success();
                }
                Ok(value)
            }
            Err(error) => {
                if let Some(breaker) = &self.circuit_breaker {
                    breaker.on_failure(&error.failure_kind());
                }
                Err(ResilienceError::Operation(error))
            }
        }
    }
}

/// Builder for ResilienceManager
pub struct ResilienceManagerBuilder {
    name: String,
    config: ResilienceConfig,
    clock: SharedClock,
    sleeper: SharedSleeper,
    jitter: SharedJitter,
    refresher: Option<SharedRefresher>,
}

impl fmt::Debug for ResilienceManagerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResilienceManagerBuilder")
            .field("name", &self.name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ResilienceManagerBuilder {
    /// Start a builder with every stage on its default policy.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            config: ResilienceConfig::default(),
            clock: system_clock(),
            sleeper: tokio_sleeper(),
            jitter: thread_rng_jitter(),
            refresher: None,
        }
    }

    /// Replace every stage setting at once.
    pub fn config(mut self, config: ResilienceConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the retry stage.
    pub fn retry(mut self, setting: impl Into<PolicySetting<RetryPolicy>>) -> Self {
        self.config.retry = setting.into();
        self
    }

    /// Set the circuit breaker stage.
    pub fn circuit_breaker(
        mut self,
        setting: impl Into<PolicySetting<CircuitBreakerPolicy>>,
    ) -> Self {
        self.config.circuit_breaker = setting.into();
        self
    }

    /// Set the rate limiter stage.
    pub fn rate_limit(mut self, setting: impl Into<PolicySetting<RateLimitPolicy>>) -> Self {
        self.config.rate_limit = setting.into();
        self
    }

    /// Set the recovery stage.
    pub fn recovery(mut self, setting: impl Into<PolicySetting<RecoveryPolicy>>) -> Self {
        self.config.recovery = setting.into();
        self
    }

    /// Set a custom clock (useful for testing)
    pub fn clock(mut self, clock: impl Clock) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Set a custom sleeper (useful for testing)
    pub fn sleeper(mut self, sleeper: impl Sleeper) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    /// Set a custom jitter source (useful for testing)
    pub fn jitter(mut self, jitter: impl JitterSource) -> Self {
        self.jitter = Arc::new(jitter);
        self
    }

    /// Credential refresher consulted on authorization failures.
    pub fn refresher(mut self, refresher: SharedRefresher) -> Self {
        self.refresher = Some(refresher);
        self
    }

    /// Validate every enabled policy and assemble the manager.
    pub fn build(self) -> ConfigResult<ResilienceManager> {
        let Self { name, config, clock, sleeper, jitter, refresher } = self;
        config.validate()?;

        let retry = config
            .retry
            .resolve()
            .map(|policy| RetryExecutor::with_runtime(policy, Arc::clone(&sleeper), jitter))
            .transpose()?;

        let circuit_breaker = config
            .circuit_breaker
            .resolve()
            .map(|policy| CircuitBreaker::with_clock(name.clone(), policy, Arc::clone(&clock)))
            .transpose()?;

        let rate_limiter = config
            .rate_limit
            .resolve()
            .map(|policy| RateLimiter::with_runtime(policy, clock, Arc::clone(&sleeper)))
            .transpose()?;

        let recovery = config
            .recovery
            .resolve()
            .map(|policy| RecoveryExecutor::with_runtime(policy, sleeper))
            .transpose()?
            .map(|executor| match refresher {
                Some(refresher) => executor.with_refresher(refresher),
                None => executor,
            });

        debug!(
            manager = %name,
            retry = retry.is_some(),
            circuit_breaker = circuit_breaker.is_some(),
            rate_limit = rate_limiter.is_some(),
            recovery = recovery.is_some(),
            "resilience manager configured"
        );

        Ok(ResilienceManager { name, retry, circuit_breaker, rate_limiter, recovery })
    }
}
