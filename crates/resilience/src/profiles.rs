//! Resilience presets per connector kind
//!
//! [`profile_for`] is a pure lookup: it returns a fresh [`ResilienceConfig`]
//! tuned for how a family of remote systems fails and throttles.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::circuit_breaker::CircuitBreakerPolicy;
use crate::config::{PolicySetting, ResilienceConfig};
use crate::rate_limiter::{BackpressureStrategy, RateLimitPolicy};
use crate::retry::RetryPolicy;

/// Family of remote systems a connector talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectorKind {
    /// Relational and analytical databases
    Database,
    /// S3-style object stores
    ObjectStorage,
    /// Generic REST and HTTP APIs
    HttpApi,
    /// Hosted spreadsheets with strict per-minute quotas
    Spreadsheet,
    /// Files on a local or mounted filesystem
    LocalFile,
}

impl ConnectorKind {
    /// Every connector kind, in declaration order.
    pub const ALL: [ConnectorKind; 5] = [
        ConnectorKind::Database,
        ConnectorKind::ObjectStorage,
        ConnectorKind::HttpApi,
        ConnectorKind::Spreadsheet,
        ConnectorKind::LocalFile,
    ];

    /// Lowercase name as it appears in config files.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::ObjectStorage => "object_storage",
            Self::HttpApi => "http_api",
            Self::Spreadsheet => "spreadsheet",
            Self::LocalFile => "local_file",
        }
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectorKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown connector kind: {s}"))
    }
}

/// Resilience preset for a connector kind.
pub fn profile_for(kind: ConnectorKind) -> ResilienceConfig {
    match kind {
        ConnectorKind::Database => ResilienceConfig {
            retry: retry(3, Duration::from_millis(500), Duration::from_secs(30)),
            circuit_breaker: PolicySetting::Custom(breaker(5, Duration::from_secs(30))),
            rate_limit: PolicySetting::Disabled,
            recovery: PolicySetting::Default,
        },
        ConnectorKind::ObjectStorage => ResilienceConfig {
            retry: retry(5, Duration::from_millis(200), Duration::from_secs(20)),
            circuit_breaker: PolicySetting::Default,
            rate_limit: PolicySetting::Custom(RateLimitPolicy {
                max_per_period: 100,
                period: Duration::from_secs(1),
                burst_size: 100,
                strategy: BackpressureStrategy::Wait,
                ..RateLimitPolicy::default()
            }),
            recovery: PolicySetting::Default,
        },
        ConnectorKind::HttpApi => ResilienceConfig {
            retry: retry(4, Duration::from_secs(1), Duration::from_secs(60)),
            circuit_breaker: PolicySetting::Custom(breaker(3, Duration::from_secs(60))),
            rate_limit: PolicySetting::Custom(RateLimitPolicy {
                max_per_period: 10,
                period: Duration::from_secs(1),
                burst_size: 20,
                per_key: true,
                strategy: BackpressureStrategy::Queue,
                max_wait: Duration::from_secs(10),
            }),
            recovery: PolicySetting::Default,
        },
        ConnectorKind::Spreadsheet => ResilienceConfig {
            retry: retry(5, Duration::from_secs(2), Duration::from_secs(64)),
            circuit_breaker: PolicySetting::Default,
            rate_limit: PolicySetting::Custom(RateLimitPolicy {
                max_per_period: 60,
                period: Duration::from_secs(60),
                burst_size: 10,
                strategy: BackpressureStrategy::Wait,
                ..RateLimitPolicy::default()
            }),
            recovery: PolicySetting::Default,
        },
        ConnectorKind::LocalFile => ResilienceConfig {
            retry: PolicySetting::Default,
            circuit_breaker: PolicySetting::Disabled,
            rate_limit: PolicySetting::Disabled,
            recovery: PolicySetting::Disabled,
        },
    }
}

fn retry(
    max_attempts: u32,
    initial_delay: Duration,
    max_delay: Duration,
) -> PolicySetting<RetryPolicy> {
    PolicySetting::Custom(RetryPolicy {
        max_attempts,
        initial_delay,
        max_delay,
        ..RetryPolicy::default()
    })
}

fn breaker(failure_threshold: u32, recovery_timeout: Duration) -> CircuitBreakerPolicy {
    CircuitBreakerPolicy { failure_threshold, recovery_timeout, ..CircuitBreakerPolicy::default() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_profile_is_valid() {
        for kind in ConnectorKind::ALL {
            profile_for(kind).validate().unwrap_or_else(|e| panic!("{kind}: {e}"));
        }
    }

    #[test]
    fn test_database_profile() {
        let config = profile_for(ConnectorKind::Database);
        let retry = config.retry.resolve().unwrap();
        assert_eq!(retry.max_attempts, 3);
        assert_eq!(retry.initial_delay, Duration::from_millis(500));
        assert_eq!(retry.max_delay, Duration::from_secs(30));
        let breaker = config.circuit_breaker.resolve().unwrap();
        assert_eq!(breaker.recovery_timeout, Duration::from_secs(30));
        assert!(!config.rate_limit.is_enabled());
    }

    #[test]
    fn test_http_api_profile_queues_per_key() {
        let rate_limit = profile_for(ConnectorKind::HttpApi).rate_limit.resolve().unwrap();
        assert!(rate_limit.per_key);
        assert_eq!(rate_limit.strategy, BackpressureStrategy::Queue);
        assert_eq!(rate_limit.burst_size, 20);
        assert_eq!(rate_limit.max_wait, Duration::from_secs(10));
    }

    #[test]
    fn test_spreadsheet_profile_refills_one_per_second() {
        let rate_limit = profile_for(ConnectorKind::Spreadsheet).rate_limit.resolve().unwrap();
        assert!((rate_limit.refill_rate() - 1.0).abs() < f64::EPSILON);
        assert_eq!(rate_limit.burst_size, 10);
    }

    #[test]
    fn test_local_file_profile_only_retries() {
        let config = profile_for(ConnectorKind::LocalFile);
        assert!(config.retry.is_enabled());
        assert!(!config.circuit_breaker.is_enabled());
        assert!(!config.rate_limit.is_enabled());
        assert!(!config.recovery.is_enabled());
    }

    #[test]
    fn test_for_connector_matches_profile_for() {
        for kind in ConnectorKind::ALL {
            assert_eq!(ResilienceConfig::for_connector(kind), profile_for(kind));
        }
    }

    #[test]
    fn test_connector_kind_parsing() {
        assert_eq!("http_api".parse::<ConnectorKind>().unwrap(), ConnectorKind::HttpApi);
        assert_eq!("DATABASE".parse::<ConnectorKind>().unwrap(), ConnectorKind::Database);
        assert!("mainframe".parse::<ConnectorKind>().is_err());
        assert_eq!(ConnectorKind::ObjectStorage.to_string(), "object_storage");
    }
}
