//! Token-bucket rate limiting with a backpressure strategy
//!
//! A [`TokenBucket`] holds up to `burst_size` tokens and refills lazily at
//! `max_per_period / period` tokens per second, computed from the clock on
//! every access. [`RateLimiter`] owns either one global bucket or one bucket
//! per caller-supplied key, and decides what happens when a bucket is empty:
//!
//! - **WAIT**: suspend until a token is due, then proceed
//! - **DROP**: fail immediately with [`RateLimitError::Limited`]
//! - **QUEUE**: wait like WAIT, unless the total wait would exceed
//!   `max_wait`, in which case fail with [`RateLimitError::QueueFull`]

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{ConfigError, ConfigResult, RateLimitError, ResilienceError};
use crate::serde_utils::duration_millis;
use crate::time::{system_clock, tokio_sleeper, SharedClock, SharedSleeper};

/// Bucket key used when no key is supplied or keys are not in use.
pub const GLOBAL_KEY: &str = "__global__";

/// Default number of calls admitted per period
pub const DEFAULT_MAX_PER_PERIOD: u32 = 10;

/// Default refill period
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(1);

/// Default bucket capacity
pub const DEFAULT_BURST_SIZE: u32 = 10;

/// Default QUEUE wait ceiling
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(5);

// Absorbs float error so a bucket refilled for exactly `time_until(n)`
// always admits `n`.
const TOKEN_EPSILON: f64 = 1e-9;

/// What the limiter does when a bucket has no token available
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackpressureStrategy {
    /// Suspend the caller until a token is available.
    #[default]
    Wait,
    /// Reject the call immediately.
    Drop,
    /// Wait up to `max_wait`, then reject.
    Queue,
}

impl fmt::Display for BackpressureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Wait => write!(f, "WAIT"),
            Self::Drop => write!(f, "DROP"),
            Self::Queue => write!(f, "QUEUE"),
        }
    }
}

/// Configuration for the rate limiter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RateLimitPolicy {
    /// Calls admitted per `period` at steady state
    pub max_per_period: u32,
    /// Length of one rate period
    #[serde(rename = "period_ms", with = "duration_millis")]
    pub period: Duration,
    /// Bucket capacity, the largest burst admitted at once
    pub burst_size: u32,
    /// One bucket per caller key instead of one global bucket.
    ///
    /// Per-key buckets are kept for the limiter's lifetime and never
    /// evicted, so keys should come from a bounded set such as tenant or
    /// account ids, not request ids.
    pub per_key: bool,
    /// Behavior when a bucket is empty
    pub strategy: BackpressureStrategy,
    /// Ceiling on the total wait under QUEUE
    #[serde(rename = "max_wait_ms", with = "duration_millis")]
    pub max_wait: Duration,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            max_per_period: DEFAULT_MAX_PER_PERIOD,
            period: DEFAULT_PERIOD,
            burst_size: DEFAULT_BURST_SIZE,
            per_key: false,
            strategy: BackpressureStrategy::Wait,
            max_wait: DEFAULT_MAX_WAIT,
        }
    }
}

impl RateLimitPolicy {
    /// Create a policy builder
    pub fn builder() -> RateLimitPolicyBuilder {
        RateLimitPolicyBuilder::new()
    }

    /// Validate the policy
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_per_period == 0 {
            return Err(ConfigError::invalid("rate_limit.max_per_period", "must be at least 1"));
        }
        if self.period.is_zero() {
            return Err(ConfigError::invalid("rate_limit.period", "must be greater than zero"));
        }
        if self.burst_size == 0 {
            return Err(ConfigError::invalid("rate_limit.burst_size", "must be at least 1"));
        }
        Ok(())
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.max_per_period) / self.period.as_secs_f64()
    }
}

/// Builder for RateLimitPolicy
#[derive(Debug, Default)]
pub struct RateLimitPolicyBuilder {
    policy: RateLimitPolicy,
}

impl RateLimitPolicyBuilder {
    /// Start from the default policy.
    pub fn new() -> Self {
        Self { policy: RateLimitPolicy::default() }
    }

    /// Tokens refilled per period.
    pub fn max_per_period(mut self, max: u32) -> Self {
        self.policy.max_per_period = max;
        self
    }

    /// Length of one refill period.
    pub fn period(mut self, period: Duration) -> Self {
        self.policy.period = period;
        self
    }

    /// Bucket capacity.
    pub fn burst_size(mut self, burst: u32) -> Self {
        self.policy.burst_size = burst;
        self
    }

    /// Keep one bucket per caller key.
    pub fn per_key(mut self, per_key: bool) -> Self {
        self.policy.per_key = per_key;
        self
    }

    /// What to do when the bucket is empty.
    pub fn strategy(mut self, strategy: BackpressureStrategy) -> Self {
        self.policy.strategy = strategy;
        self
    }

    /// Longest total wait under the queue strategy.
    pub fn max_wait(mut self, max_wait: Duration) -> Self {
        self.policy.max_wait = max_wait;
        self
    }

    /// Validate and return the policy.
    pub fn build(self) -> ConfigResult<RateLimitPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Single-key token accumulator with lazy refill.
///
/// Starts full. Tokens are fractional so slow rates (one call per minute)
/// accrue smoothly.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    clock: SharedClock,
    state: Mutex<BucketState>,
}

impl fmt::Debug for TokenBucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenBucket")
            .field("capacity", &self.capacity)
            .field("refill_rate", &self.refill_rate)
            .field("tokens", &self.state.lock().tokens)
            .finish()
    }
}

impl TokenBucket {
    /// Create a full bucket holding `capacity` tokens that refills at
    /// `refill_rate` tokens per second.
    pub fn with_clock(capacity: u32, refill_rate: f64, clock: SharedClock) -> ConfigResult<Self> {
        if capacity == 0 {
            return Err(ConfigError::invalid("token_bucket.capacity", "must be at least 1"));
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(ConfigError::invalid(
                "token_bucket.refill_rate",
                format!("must be a positive finite rate, got {refill_rate}"),
            ));
        }

        Ok(Self::full(f64::from(capacity), refill_rate, clock))
    }

    /// Create a bucket sized by a rate-limit policy.
    pub fn from_policy(policy: &RateLimitPolicy, clock: SharedClock) -> ConfigResult<Self> {
        policy.validate()?;
        Ok(Self::full(f64::from(policy.burst_size), policy.refill_rate(), clock))
    }

    fn full(capacity: f64, refill_rate: f64, clock: SharedClock) -> Self {
        let now = clock.now();
        Self {
            capacity,
            refill_rate,
            clock,
            state: Mutex::new(BucketState { tokens: capacity, last_refill: now }),
        }
    }

    /// Maximum number of tokens the bucket holds.
    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Tokens added per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Tokens currently available, after refill.
    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    /// Take `n` tokens if they are available. Leaves the token count
    /// untouched (beyond refill) when they are not.
    pub fn try_consume(&self, n: u32) -> bool {
        let wanted = f64::from(n);
        let mut state = self.state.lock();
        self.refill(&mut state);

        if state.tokens + TOKEN_EPSILON >= wanted {
            state.tokens = (state.tokens - wanted).max(0.0);
            true
        } else {
            false
        }
    }

    /// Time until `n` tokens will be available; zero if they already are.
    ///
    /// Returns [`Duration::MAX`] when `n` exceeds the capacity.
    pub fn time_until(&self, n: u32) -> Duration {
        let wanted = f64::from(n);
        if wanted > self.capacity {
            return Duration::MAX;
        }

        let mut state = self.state.lock();
        self.refill(&mut state);

        if state.tokens + TOKEN_EPSILON >= wanted {
            return Duration::ZERO;
        }

        let seconds = (wanted - state.tokens) / self.refill_rate;
        let Ok(wait) = Duration::try_from_secs_f64(seconds) else {
            return Duration::MAX;
        };
        // Round up to the next nanosecond only when the conversion dropped a
        // fraction, so whole waits stay exact.
        if wait.as_secs_f64() < seconds {
            wait.saturating_add(Duration::from_nanos(1))
        } else {
            wait
        }
    }

    fn refill(&self, state: &mut BucketState) {
        let now = self.clock.now();
        let elapsed = now.saturating_duration_since(state.last_refill);
        if elapsed.is_zero() {
            return;
        }
        state.tokens = (state.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        state.last_refill = now;
    }
}

/// Rate limiter owning one global bucket or one bucket per key.
///
/// Per-key buckets are created on first use and retained until the limiter
/// is dropped.
pub struct RateLimiter {
    policy: RateLimitPolicy,
    clock: SharedClock,
    sleeper: SharedSleeper,
    global: Option<Arc<TokenBucket>>,
    buckets: DashMap<String, Arc<TokenBucket>>,
}

impl fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &self.policy)
            .field("buckets", &self.bucket_count())
            .finish_non_exhaustive()
    }
}

impl RateLimiter {
    /// Create a limiter on the system clock that waits on tokio.
    pub fn new(policy: RateLimitPolicy) -> ConfigResult<Self> {
        Self::with_runtime(policy, system_clock(), tokio_sleeper())
    }

    /// Create a limiter with an injected clock and sleeper.
    pub fn with_runtime(
        policy: RateLimitPolicy,
        clock: SharedClock,
        sleeper: SharedSleeper,
    ) -> ConfigResult<Self> {
        policy.validate()?;
        let global = if policy.per_key {
            None
        } else {
            Some(Arc::new(TokenBucket::full(
                f64::from(policy.burst_size),
                policy.refill_rate(),
                Arc::clone(&clock),
            )))
        };

        Ok(Self { policy, clock, sleeper, global, buckets: DashMap::new() })
    }

    /// Policy this limiter was built with.
    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }

    /// Number of buckets created so far.
    pub fn bucket_count(&self) -> usize {
        match self.global {
            Some(_) => 1,
            None => self.buckets.len(),
        }
    }

    /// The bucket that admits calls for `key`, creating it on first use.
    ///
    /// A created bucket is never removed; later calls for the same key
    /// share it.
    pub fn bucket(&self, key: Option<&str>) -> Arc<TokenBucket> {
        if let Some(global) = &self.global {
            return Arc::clone(global);
        }

        let key = key.unwrap_or(GLOBAL_KEY);
        if let Some(existing) = self.buckets.get(key) {
            return Arc::clone(existing.value());
        }

        let entry = self.buckets.entry(key.to_owned()).or_insert_with(|| {
            Arc::new(TokenBucket::full(
                f64::from(self.policy.burst_size),
                self.policy.refill_rate(),
                Arc::clone(&self.clock),
            ))
        });
        Arc::clone(entry.value())
    }

    /// Admit one call for `key`, applying the backpressure strategy.
    pub async fn acquire(&self, key: Option<&str>) -> Result<(), RateLimitError> {
        let bucket_key = if self.policy.per_key { key.unwrap_or(GLOBAL_KEY) } else { GLOBAL_KEY };
        let bucket = self.bucket(key);
        let mut waited = Duration::ZERO;

        loop {
            if bucket.try_consume(1) {
                if !waited.is_zero() {
                    debug!(
                        key = bucket_key,
                        waited_ms = millis(waited),
                        "rate limit token acquired after waiting"
                    );
                }
                return Ok(());
            }

            let wait = bucket.time_until(1);
            match self.policy.strategy {
                BackpressureStrategy::Drop => {
                    warn!(key = bucket_key, "rate limit exceeded, dropping call");
                    return Err(RateLimitError::Limited { key: bucket_key.to_owned() });
                }
                BackpressureStrategy::Queue => {
                    let total = waited.saturating_add(wait);
                    if total > self.policy.max_wait {
                        warn!(
                            key = bucket_key,
                            wait_ms = millis(total),
                            max_wait_ms = millis(self.policy.max_wait),
                            "rate limit queue full"
                        );
                        return Err(RateLimitError::QueueFull {
                            key: bucket_key.to_owned(),
                            wait: total,
                            max_wait: self.policy.max_wait,
                        });
                    }
                }
                BackpressureStrategy::Wait => {}
            }

            debug!(key = bucket_key, wait_ms = millis(wait), "waiting for rate limit token");
            self.sleeper.sleep(wait).await;
            waited = waited.saturating_add(wait);
        }
    }

    /// Execute an operation once a token for `key` is admitted.
    pub async fn execute<F, Fut, T, E>(
        &self,
        operation: F,
        key: Option<&str>,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.acquire(key).await?;
        operation().await.map_err(ResilienceError::Operation)
    }
}

fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
