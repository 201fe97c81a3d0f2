//! Serde adapters for policy fields

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serializer};

/// `Duration` as an integer count of milliseconds.
///
/// Every policy duration is written as a `*_ms` field, e.g.
/// `recovery_timeout_ms = 30000`. Durations too large for a `u64` of
/// milliseconds saturate on output.
///
/// ```rust
/// use std::time::Duration;
///
/// use connector_resilience::serde_utils::duration_millis;
/// use serde::Deserialize;
///
/// #[derive(Deserialize)]
/// struct Backoff {
///     #[serde(rename = "delay_ms", with = "duration_millis")]
///     delay: Duration,
/// }
///
/// let backoff: Backoff = toml::from_str("delay_ms = 750").unwrap();
/// assert_eq!(backoff.delay, Duration::from_millis(750));
/// ```
pub mod duration_millis {
    use super::{Deserialize, Deserializer, Duration, Serializer};

    /// Write the duration as whole milliseconds.
    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(value.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    /// Read an unsigned millisecond count.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
