//! Fetching Configuration
//!
//! Cycle timing and benchmark selection. Loaded from a serialized config or
//! from `POSTURE_*` environment variables, with defaults for anything unset.

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Cycle period used when none is configured
pub const DEFAULT_PERIOD: Duration = Duration::from_secs(4 * 60 * 60);

/// How often organization benchmarks re-list their accounts by default
pub const DEFAULT_ACCOUNT_REFRESH: Duration = Duration::from_secs(24 * 60 * 60);

/// Which compliance benchmark decides the fetchers to register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BenchmarkKind {
    #[default]
    CisK8s,
    CisEks,
    CisAws,
    CisAwsOrg,
    CisAzure,
    CisGcp,
}

impl BenchmarkKind {
    pub const ALL: [BenchmarkKind; 6] = [
        BenchmarkKind::CisK8s,
        BenchmarkKind::CisEks,
        BenchmarkKind::CisAws,
        BenchmarkKind::CisAwsOrg,
        BenchmarkKind::CisAzure,
        BenchmarkKind::CisGcp,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BenchmarkKind::CisK8s => "cis_k8s",
            BenchmarkKind::CisEks => "cis_eks",
            BenchmarkKind::CisAws => "cis_aws",
            BenchmarkKind::CisAwsOrg => "cis_aws_org",
            BenchmarkKind::CisAzure => "cis_azure",
            BenchmarkKind::CisGcp => "cis_gcp",
        }
    }
}

impl fmt::Display for BenchmarkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BenchmarkKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let name = s.trim().to_ascii_lowercase();
        BenchmarkKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == name)
            .ok_or_else(|| ConfigError::UnsupportedBenchmark(s.to_string()))
    }
}

/// Timing and benchmark settings consumed by the manager and builder.
///
/// Durations are (de)serialized as whole seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchingConfig {
    /// Interval between cycle starts
    #[serde(with = "seconds")]
    pub period: Duration,

    /// Per-fetcher time budget; the period when unset
    #[serde(with = "optional_seconds", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,

    /// Account discovery interval for organization benchmarks
    #[serde(with = "seconds")]
    pub account_refresh: Duration,

    pub benchmark: BenchmarkKind,
}

impl Default for FetchingConfig {
    fn default() -> Self {
        Self {
            period: DEFAULT_PERIOD,
            timeout: None,
            account_refresh: DEFAULT_ACCOUNT_REFRESH,
            benchmark: BenchmarkKind::default(),
        }
    }
}

impl FetchingConfig {
    /// Load from the process environment:
    ///
    /// - `POSTURE_PERIOD_SECS`
    /// - `POSTURE_FETCHER_TIMEOUT_SECS`
    /// - `POSTURE_ACCOUNT_REFRESH_SECS`
    /// - `POSTURE_BENCHMARK`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let seconds_var = |name: &'static str| -> Result<Option<Duration>, ConfigError> {
            lookup(name)
                .map(|value| {
                    value
                        .trim()
                        .parse::<u64>()
                        .map(Duration::from_secs)
                        .map_err(|_| ConfigError::InvalidValue { name, value })
                })
                .transpose()
        };

        let config = Self {
            period: seconds_var("POSTURE_PERIOD_SECS")?.unwrap_or(defaults.period),
            timeout: seconds_var("POSTURE_FETCHER_TIMEOUT_SECS")?,
            account_refresh: seconds_var("POSTURE_ACCOUNT_REFRESH_SECS")?
                .unwrap_or(defaults.account_refresh),
            benchmark: match lookup("POSTURE_BENCHMARK") {
                Some(value) => value.parse()?,
                None => defaults.benchmark,
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// The effective per-fetcher timeout
    pub fn fetcher_timeout(&self) -> Duration {
        self.timeout.unwrap_or(self.period)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.period.is_zero() {
            return Err(ConfigError::ZeroDuration("period"));
        }
        if self.account_refresh.is_zero() {
            return Err(ConfigError::ZeroDuration("account_refresh"));
        }

        let timeout = self.fetcher_timeout();
        if timeout.is_zero() {
            return Err(ConfigError::ZeroDuration("timeout"));
        }
        if timeout > self.period {
            return Err(ConfigError::TimeoutExceedsPeriod {
                timeout,
                period: self.period,
            });
        }

        Ok(())
    }
}

mod seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

mod optional_seconds {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|secs| secs.map(Duration::from_secs))
    }
}
