//! Resilience configuration
//!
//! A [`ResilienceConfig`] holds one [`PolicySetting`] per stage. Each setting
//! is either disabled (the stage is absent from the call path), the stage's
//! defaults, or a custom policy. In TOML:
//!
//! ```toml
//! retry = "default"
//! circuit_breaker = "disabled"
//!
//! [rate_limit]
//! max_per_period = 100
//! period_ms = 1000
//! burst_size = 20
//! per_key = true
//! strategy = "queue"
//! max_wait_ms = 2000
//! ```
//!
//! A stage that is not mentioned uses its defaults.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::circuit_breaker::CircuitBreakerPolicy;
use crate::error::{ConfigError, ConfigResult};
use crate::profiles::{profile_for, ConnectorKind};
use crate::rate_limiter::RateLimitPolicy;
use crate::recovery::RecoveryPolicy;
use crate::retry::RetryPolicy;

/// A policy that can check its own invariants.
pub trait ValidatePolicy {
    fn validate(&self) -> ConfigResult<()>;
}

impl ValidatePolicy for RetryPolicy {
    fn validate(&self) -> ConfigResult<()> {
        RetryPolicy::validate(self)
    }
}

impl ValidatePolicy for CircuitBreakerPolicy {
    fn validate(&self) -> ConfigResult<()> {
        CircuitBreakerPolicy::validate(self)
    }
}

impl ValidatePolicy for RateLimitPolicy {
    fn validate(&self) -> ConfigResult<()> {
        RateLimitPolicy::validate(self)
    }
}

impl ValidatePolicy for RecoveryPolicy {
    fn validate(&self) -> ConfigResult<()> {
        RecoveryPolicy::validate(self)
    }
}

/// Setting for one optional resilience stage.
///
/// "Disabled" and "use the defaults" are distinct states.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PolicySetting<P> {
    /// The stage is left out of the call path.
    Disabled,
    /// The stage runs with `P::default()`.
    #[default]
    Default,
    /// The stage runs with this policy.
    Custom(P),
}

impl<P> PolicySetting<P>
where
    P: Default + Clone,
{
    /// The effective policy, or `None` when the stage is disabled.
    pub fn resolve(&self) -> Option<P> {
        match self {
            Self::Disabled => None,
            Self::Default => Some(P::default()),
            Self::Custom(policy) => Some(policy.clone()),
        }
    }

    /// Whether this stage runs at all.
    pub fn is_enabled(&self) -> bool {
        !matches!(self, Self::Disabled)
    }
}

impl<P: ValidatePolicy> PolicySetting<P> {
    /// Validate a custom policy; the other states are always valid.
    pub fn validate(&self) -> ConfigResult<()> {
        match self {
            Self::Custom(policy) => policy.validate(),
            Self::Disabled | Self::Default => Ok(()),
        }
    }
}

impl<P> From<P> for PolicySetting<P> {
    fn from(policy: P) -> Self {
        Self::Custom(policy)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum SettingKeyword {
    Disabled,
    Default,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawSetting<P> {
    Keyword(SettingKeyword),
    Toggle(bool),
    Custom(P),
}

impl<'de, P> Deserialize<'de> for PolicySetting<P>
where
    P: Deserialize<'de>,
{
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(match RawSetting::deserialize(deserializer)? {
            RawSetting::Keyword(SettingKeyword::Disabled) | RawSetting::Toggle(false) => {
                Self::Disabled
            }
            RawSetting::Keyword(SettingKeyword::Default) | RawSetting::Toggle(true) => {
                Self::Default
            }
            RawSetting::Custom(policy) => Self::Custom(policy),
        })
    }
}

impl<P> Serialize for PolicySetting<P>
where
    P: Serialize,
{
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Disabled => serializer.serialize_str("disabled"),
            Self::Default => serializer.serialize_str("default"),
            Self::Custom(policy) => policy.serialize(serializer),
        }
    }
}

/// Resilience section of a connector's configuration.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ResilienceConfig {
    /// Retry stage.
    pub retry: PolicySetting<RetryPolicy>,
    /// Circuit breaker stage.
    pub circuit_breaker: PolicySetting<CircuitBreakerPolicy>,
    /// Rate limiter stage.
    pub rate_limit: PolicySetting<RateLimitPolicy>,
    /// Recovery stage.
    pub recovery: PolicySetting<RecoveryPolicy>,
}

impl ResilienceConfig {
    /// Every stage disabled: operations run exactly once, unguarded.
    pub fn disabled() -> Self {
        Self {
            retry: PolicySetting::Disabled,
            circuit_breaker: PolicySetting::Disabled,
            rate_limit: PolicySetting::Disabled,
            recovery: PolicySetting::Disabled,
        }
    }

    /// Preset for a connector kind.
    pub fn for_connector(kind: ConnectorKind) -> Self {
        profile_for(kind)
    }

    /// Validate every custom policy.
    pub fn validate(&self) -> ConfigResult<()> {
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.rate_limit.validate()?;
        self.recovery.validate()
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(input: &str) -> ConfigResult<Self> {
        let config: Self = toml::from_str(input)
            .map_err(|e| ConfigError::Parse { format: "TOML", message: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate a JSON document.
    pub fn from_json_str(input: &str) -> ConfigResult<Self> {
        let config: Self = serde_json::from_str(input)
            .map_err(|e| ConfigError::Parse { format: "JSON", message: e.to_string() })?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.toml` or `.json` file.
    pub fn from_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let format = ConfigFormat::from_path(path)
            .ok_or_else(|| ConfigError::UnsupportedFormat { path: path.to_path_buf() })?;
        let contents = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })?;

        match format {
            ConfigFormat::Toml => Self::from_toml_str(&contents),
            ConfigFormat::Json => Self::from_json_str(&contents),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConfigFormat {
    Toml,
    Json,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Option<Self> {
        let extension = path.extension()?.to_str()?;
        if extension.eq_ignore_ascii_case("toml") {
            Some(Self::Toml)
        } else if extension.eq_ignore_ascii_case("json") {
            Some(Self::Json)
        } else {
            None
        }
    }
}
