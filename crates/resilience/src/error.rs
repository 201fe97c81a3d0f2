//! Failure classification and error types for the resilience pipeline
//!
//! The pipeline never inspects a host error directly. Every connector error
//! type implements [`ClassifyFailure`], which maps it onto a [`FailureKind`].
//! Retry, circuit-breaker and recovery decisions are all made from that
//! kind alone.
//!
//! ## Error Taxonomy
//!
//! | Kind | Examples | Retried by default | Counts as breaker failure |
//! |------|----------|--------------------|---------------------------|
//! | `Connectivity` / `Timeout` | refused socket, DNS failure, read timeout | yes | yes |
//! | `Status(code)` | HTTP 503, HTTP 404 | only 5xx | yes |
//! | `Provider(code)` | `ThrottlingException`, `NoSuchKey` | only throttling/internal codes | yes |
//! | `Validation` | bad parameter, missing column | never | no (excluded by default) |
//! | `CircuitOpen` / `RateLimited` | synthesized here | no | no |
//!
//! Errors surface to callers as [`ResilienceError<E>`]: either the original
//! operation error untouched (`Operation`), or one of the kinds synthesized
//! by this crate (`CircuitOpen`, `RateLimited`, `QueueFull`).

use std::fmt;
use std::io;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Classified failure of a remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailureKind {
    /// The remote endpoint could not be reached (refused, reset, DNS).
    Connectivity,
    /// The remote endpoint did not answer in time.
    Timeout,
    /// A transport error carrying an HTTP-like status code.
    Status(u16),
    /// A cloud-provider error carrying a service error code.
    Provider(String),
    /// Invalid parameters or configuration supplied by the caller.
    Validation,
    /// Synthesized: an open circuit rejected the call.
    CircuitOpen,
    /// Synthesized: the rate limiter rejected the call.
    RateLimited,
    /// Anything the host could not classify further.
    Other,
}

impl FailureKind {
    /// Status code used by remote services to signal missing or expired
    /// credentials.
    pub const UNAUTHORIZED: u16 = 401;

    /// Payload-free category of this kind, used by configured kind sets.
    pub fn category(&self) -> FailureCategory {
        match self {
            Self::Connectivity => FailureCategory::Connectivity,
            Self::Timeout => FailureCategory::Timeout,
            Self::Status(_) => FailureCategory::Status,
            Self::Provider(_) => FailureCategory::Provider,
            Self::Validation => FailureCategory::Validation,
            Self::CircuitOpen => FailureCategory::CircuitOpen,
            Self::RateLimited => FailureCategory::RateLimited,
            Self::Other => FailureCategory::Other,
        }
    }

    /// Whether this failure belongs to the unreachable/timeout family.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity | Self::Timeout)
    }

    /// Whether this failure is an authorization failure.
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Status(code) if *code == Self::UNAUTHORIZED)
    }

    /// Whether this failure was synthesized by the resilience pipeline.
    pub fn is_synthesized(&self) -> bool {
        matches!(self, Self::CircuitOpen | Self::RateLimited)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connectivity => write!(f, "connectivity"),
            Self::Timeout => write!(f, "timeout"),
            Self::Status(code) => write!(f, "status {code}"),
            Self::Provider(code) => write!(f, "provider code {code}"),
            Self::Validation => write!(f, "validation"),
            Self::CircuitOpen => write!(f, "circuit open"),
            Self::RateLimited => write!(f, "rate limited"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Payload-free failure category, the unit of `retryable_kinds` and
/// `excluded_kinds` configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    /// [`FailureKind::Connectivity`]
    Connectivity,
    /// [`FailureKind::Timeout`]
    Timeout,
    /// [`FailureKind::Status`], any code
    Status,
    /// [`FailureKind::Provider`], any code
    Provider,
    /// [`FailureKind::Validation`]
    Validation,
    /// [`FailureKind::CircuitOpen`]
    CircuitOpen,
    /// [`FailureKind::RateLimited`]
    RateLimited,
    /// [`FailureKind::Other`]
    Other,
}

/// Maps a host error onto a [`FailureKind`].
///
/// Connectors implement this for their own error type so that the pipeline
/// can decide what to retry, what to count against the circuit, and what
/// to attempt recovery for.
pub trait ClassifyFailure {
    /// Classify this error.
    fn failure_kind(&self) -> FailureKind;
}

impl<T: ClassifyFailure + ?Sized> ClassifyFailure for &T {
    fn failure_kind(&self) -> FailureKind {
        (**self).failure_kind()
    }
}

impl<T: ClassifyFailure + ?Sized> ClassifyFailure for Box<T> {
    fn failure_kind(&self) -> FailureKind {
        (**self).failure_kind()
    }
}

impl ClassifyFailure for io::Error {
    fn failure_kind(&self) -> FailureKind {
        match self.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => FailureKind::Connectivity,
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => FailureKind::Timeout,
            io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => FailureKind::Validation,
            io::ErrorKind::PermissionDenied => FailureKind::Status(FailureKind::UNAUTHORIZED),
            _ => FailureKind::Other,
        }
    }
}

/// Rejection produced by the rate limiter before an operation is invoked.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    /// DROP strategy: no token was available.
    #[error("rate limit exceeded for key '{key}'")]
    Limited { key: String },

    /// QUEUE strategy: the wait for a token would exceed the ceiling.
    #[error("rate limit queue full for key '{key}': wait of {wait:?} exceeds {max_wait:?}")]
    QueueFull { key: String, wait: Duration, max_wait: Duration },
}

/// Error returned by every resilience stage.
///
/// `Operation` carries the operation's own error unchanged. All other
/// variants are synthesized by the pipeline and the wrapped operation was
/// not invoked for them.
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// The circuit breaker is open and rejected the call.
    #[error("circuit breaker '{name}' is open, rejecting calls")]
    CircuitOpen { name: String },

    /// The rate limiter dropped the call.
    #[error("rate limit exceeded for key '{key}'")]
    RateLimited { key: String },

    /// The rate limiter's bounded wait would have been exceeded.
    #[error("rate limit queue full for key '{key}': wait of {wait:?} exceeds {max_wait:?}")]
    QueueFull { key: String, wait: Duration, max_wait: Duration },

    /// The underlying operation failed.
    #[error(transparent)]
    Operation(E),
}

impl<E> ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Whether the circuit breaker rejected this call.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    /// Whether the rate limiter rejected this call (DROP or QUEUE).
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::QueueFull { .. })
    }

    /// Borrow the operation's own error, if the operation ran and failed.
    pub fn operation_error(&self) -> Option<&E> {
        match self {
            Self::Operation(error) => Some(error),
            _ => None,
        }
    }

    /// Take the operation's own error, if the operation ran and failed.
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::Operation(error) => Some(error),
            _ => None,
        }
    }
}

impl<E> ClassifyFailure for ResilienceError<E>
where
    E: ClassifyFailure + std::error::Error + Send + Sync + 'static,
{
    fn failure_kind(&self) -> FailureKind {
        match self {
            Self::CircuitOpen { .. } => FailureKind::CircuitOpen,
            Self::RateLimited { .. } | Self::QueueFull { .. } => FailureKind::RateLimited,
            Self::Operation(error) => error.failure_kind(),
        }
    }
}

impl<E> From<RateLimitError> for ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(error: RateLimitError) -> Self {
        match error {
            RateLimitError::Limited { key } => Self::RateLimited { key },
            RateLimitError::QueueFull { key, wait, max_wait } => {
                Self::QueueFull { key, wait, max_wait }
            }
        }
    }
}

/// Invalid or unreadable resilience configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A policy field is out of range.
    #[error("invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },

    /// The configuration document could not be parsed.
    #[error("failed to parse {format} configuration: {message}")]
    Parse { format: &'static str, message: String },

    /// The configuration file could not be read.
    #[error("failed to read configuration from {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The configuration file extension is not recognized.
    #[error("unsupported configuration format: {}", .path.display())]
    UnsupportedFormat { path: PathBuf },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid { field, message: message.into() }
    }
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("boom")]
    struct Boom;

    impl ClassifyFailure for Boom {
        fn failure_kind(&self) -> FailureKind {
            FailureKind::Status(503)
        }
    }

    #[test]
    fn test_failure_kind_categories() {
        assert_eq!(FailureKind::Status(500).category(), FailureCategory::Status);
        assert_eq!(
            FailureKind::Provider("SlowDown".to_string()).category(),
            FailureCategory::Provider
        );
        assert_eq!(FailureKind::Validation.category(), FailureCategory::Validation);
    }

    #[test]
    fn test_failure_kind_families() {
        assert!(FailureKind::Connectivity.is_connectivity());
        assert!(FailureKind::Timeout.is_connectivity());
        assert!(!FailureKind::Status(503).is_connectivity());

        assert!(FailureKind::Status(401).is_unauthorized());
        assert!(!FailureKind::Status(403).is_unauthorized());

        assert!(FailureKind::CircuitOpen.is_synthesized());
        assert!(!FailureKind::Other.is_synthesized());
    }

    #[test]
    fn test_io_error_classification() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(refused.failure_kind(), FailureKind::Connectivity);

        let timed_out = io::Error::from(io::ErrorKind::TimedOut);
        assert_eq!(timed_out.failure_kind(), FailureKind::Timeout);

        let invalid = io::Error::from(io::ErrorKind::InvalidInput);
        assert_eq!(invalid.failure_kind(), FailureKind::Validation);

        assert_eq!(io::Error::other("x").failure_kind(), FailureKind::Other);
    }

    #[test]
    fn test_resilience_error_classification() {
        let open: ResilienceError<Boom> = ResilienceError::CircuitOpen { name: "db".into() };
        assert_eq!(open.failure_kind(), FailureKind::CircuitOpen);
        assert!(open.is_circuit_open());

        let dropped: ResilienceError<Boom> =
            RateLimitError::Limited { key: "tenant-a".into() }.into();
        assert_eq!(dropped.failure_kind(), FailureKind::RateLimited);
        assert!(dropped.is_rate_limited());

        let failed = ResilienceError::Operation(Boom);
        assert_eq!(failed.failure_kind(), FailureKind::Status(503));
        assert!(failed.operation_error().is_some());
    }

    #[test]
    fn test_operation_error_is_transparent() {
        let failed = ResilienceError::Operation(Boom);
        assert_eq!(failed.to_string(), "boom");

        let open: ResilienceError<Boom> = ResilienceError::CircuitOpen { name: "s3".into() };
        assert!(open.to_string().contains("'s3'"));
        assert!(open.into_operation_error().is_none());
    }

    #[test]
    fn test_queue_full_conversion_keeps_fields() {
        let err: ResilienceError<Boom> = RateLimitError::QueueFull {
            key: "k".into(),
            wait: Duration::from_secs(3),
            max_wait: Duration::from_secs(1),
        }
        .into();

        match err {
            ResilienceError::QueueFull { key, wait, max_wait } => {
                assert_eq!(key, "k");
                assert_eq!(wait, Duration::from_secs(3));
                assert_eq!(max_wait, Duration::from_secs(1));
            }
            other => panic!("expected QueueFull, got {other:?}"),
        }
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::invalid("retry.max_attempts", "must be at least 1");
        assert_eq!(err.to_string(), "invalid retry.max_attempts: must be at least 1");
    }
}
