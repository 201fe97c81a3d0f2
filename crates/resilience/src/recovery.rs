//! Last-resort recovery once retries are exhausted
//!
//! [`RecoveryExecutor::attempt_recovery`] decides whether a failed operation
//! deserves one more full retry cycle. Connectivity failures are granted one
//! after a short pause; authorization failures are granted one if the
//! connector's [`CredentialRefresher`] succeeds. A per-operation-name
//! [`RecoveryTracker`] caps how often recovery is granted for the lifetime
//! of the executor.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{ConfigResult, FailureKind};
use crate::serde_utils::duration_millis;
use crate::time::{tokio_sleeper, SharedSleeper};

/// Default pause before a connectivity recovery cycle
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Default number of recoveries granted per operation name
pub const DEFAULT_MAX_RECOVERY_ATTEMPTS: u32 = 1;

/// Configuration for recovery behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RecoveryPolicy {
    /// Grant a recovery cycle for connectivity and timeout failures
    pub enable_connection_recovery: bool,
    /// Attempt a credential refresh on authorization failures
    pub enable_credential_refresh: bool,
    /// Pause before a connectivity recovery cycle
    #[serde(rename = "check_interval_ms", with = "duration_millis")]
    pub check_interval: Duration,
    /// Recoveries granted per operation name
    pub max_attempts: u32,
}

impl Default for RecoveryPolicy {
    fn default() -> Self {
        Self {
            enable_connection_recovery: true,
            enable_credential_refresh: true,
            check_interval: DEFAULT_CHECK_INTERVAL,
            max_attempts: DEFAULT_MAX_RECOVERY_ATTEMPTS,
        }
    }
}

impl RecoveryPolicy {
    /// Create a policy builder
    pub fn builder() -> RecoveryPolicyBuilder {
        RecoveryPolicyBuilder::new()
    }

    /// Validate the policy
    ///
    /// Every combination is valid; `max_attempts = 0` disables recovery.
    pub fn validate(&self) -> ConfigResult<()> {
        Ok(())
    }
}

/// Builder for RecoveryPolicy
#[derive(Debug, Default)]
pub struct RecoveryPolicyBuilder {
    policy: RecoveryPolicy,
}

impl RecoveryPolicyBuilder {
    /// Start from the default policy.
    pub fn new() -> Self {
        Self { policy: RecoveryPolicy::default() }
    }

    /// Pause and retry after connectivity failures.
    pub fn enable_connection_recovery(mut self, enabled: bool) -> Self {
        self.policy.enable_connection_recovery = enabled;
        self
    }

    /// Refresh credentials after authorization failures.
    pub fn enable_credential_refresh(mut self, enabled: bool) -> Self {
        self.policy.enable_credential_refresh = enabled;
        self
    }

    /// Pause before a connectivity recovery cycle.
    pub fn check_interval(mut self, interval: Duration) -> Self {
        self.policy.check_interval = interval;
        self
    }

    /// Recovery attempts allowed per operation name.
    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.policy.max_attempts = attempts;
        self
    }

    /// Validate and return the policy.
    pub fn build(self) -> ConfigResult<RecoveryPolicy> {
        self.policy.validate()?;
        Ok(self.policy)
    }
}

/// Recovery attempts granted per operation name.
///
/// Counts only grow; there is no reset short of dropping the tracker.
#[derive(Debug, Default)]
pub struct RecoveryTracker {
    attempts: Mutex<HashMap<String, u32>>,
}

impl RecoveryTracker {
    /// Empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recovery attempts recorded for `operation_name`.
    pub fn attempts(&self, operation_name: &str) -> u32 {
        self.attempts.lock().get(operation_name).copied().unwrap_or(0)
    }

    /// Record one attempt for `operation_name` unless `max_attempts` is
    /// already reached, returning the new count. The check and the
    /// increment happen under one lock.
    pub fn try_reserve(&self, operation_name: &str, max_attempts: u32) -> Option<u32> {
        let mut attempts = self.attempts.lock();
        let count = attempts.entry(operation_name.to_owned()).or_insert(0);
        if *count >= max_attempts {
            return None;
        }
        *count += 1;
        Some(*count)
    }
}

/// Connector hook that refreshes expired credentials.
#[async_trait]
pub trait CredentialRefresher: Send + Sync {
    /// Refresh credentials for `operation_name`. Returns true when the
    /// operation is worth retrying with the new credentials.
    async fn refresh(&self, operation_name: &str) -> bool;
}

/// Refresher for connectors without refreshable credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopRefresher;

#[async_trait]
impl CredentialRefresher for NoopRefresher {
    async fn refresh(&self, operation_name: &str) -> bool {
        debug!(operation = operation_name, "no credential refresher configured");
        false
    }
}

/// Shared credential refresher handle.
pub type SharedRefresher = Arc<dyn CredentialRefresher>;

/// Decides whether a failed operation gets one more retry cycle.
pub struct RecoveryExecutor {
    policy: RecoveryPolicy,
    tracker: RecoveryTracker,
    refresher: SharedRefresher,
    sleeper: SharedSleeper,
}

impl fmt::Debug for RecoveryExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecoveryExecutor")
            .field("policy", &self.policy)
            .field("tracker", &self.tracker)
            .finish_non_exhaustive()
    }
}

impl RecoveryExecutor {
    /// Create an executor that pauses on tokio and never refreshes
    /// credentials.
    pub fn new(policy: RecoveryPolicy) -> ConfigResult<Self> {
        Self::with_runtime(policy, tokio_sleeper())
    }

    /// Create an executor with an injected sleeper.
    pub fn with_runtime(policy: RecoveryPolicy, sleeper: SharedSleeper) -> ConfigResult<Self> {
        policy.validate()?;
        Ok(Self {
            policy,
            tracker: RecoveryTracker::new(),
            refresher: Arc::new(NoopRefresher),
            sleeper,
        })
    }

    /// Use `refresher` for authorization failures.
    pub fn with_refresher(mut self, refresher: SharedRefresher) -> Self {
        self.refresher = refresher;
        self
    }

    /// Policy this executor was built with.
    pub fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    /// Per-operation attempt counts.
    pub fn tracker(&self) -> &RecoveryTracker {
        &self.tracker
    }

    /// Whether `operation_name` may run one more retry cycle after failing
    /// with `kind`.
    ///
    /// Every call that passes the attempt cap consumes one attempt, whether
    /// or not recovery is then granted.
    pub async fn attempt_recovery(&self, operation_name: &str, kind: &FailureKind) -> bool {
        let Some(attempt) = self.tracker.try_reserve(operation_name, self.policy.max_attempts)
        else {
            warn!(
                operation = operation_name,
                max_attempts = self.policy.max_attempts,
                "recovery attempts exhausted"
            );
            return false;
        };

        if self.policy.enable_connection_recovery && kind.is_connectivity() {
            info!(
                operation = operation_name,
                attempt,
                kind = %kind,
                check_interval_ms = u64::try_from(self.policy.check_interval.as_millis())
                    .unwrap_or(u64::MAX),
                "attempting connection recovery"
            );
            self.sleeper.sleep(self.policy.check_interval).await;
            return true;
        }

        if self.policy.enable_credential_refresh && kind.is_unauthorized() {
            info!(operation = operation_name, attempt, "attempting credential refresh");
            let refreshed = self.refresher.refresh(operation_name).await;
            if !refreshed {
                warn!(operation = operation_name, "credential refresh failed");
            }
            return refreshed;
        }

        debug!(operation = operation_name, kind = %kind, "no recovery strategy for failure");
        false
    }
}
