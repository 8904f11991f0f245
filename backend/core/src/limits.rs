//! Resource-limit policy attached to the sandbox.
//!
//! A limit of `0` disables the resource: any use of it is a breach.
//! "No limit" must be spelled out as [`Limit::Unlimited`] (`"unlimited"` in config).

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A single ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Limit {
    Unlimited,
    Max(u64),
}

impl Limit {
    /// `Max(0)`: the resource may not be used at all.
    pub fn is_disabled(&self) -> bool {
        matches!(self, Limit::Max(0))
    }

    /// Whether `amount` stays within the ceiling.
    pub fn permits(&self, amount: u64) -> bool {
        match self {
            Limit::Unlimited => true,
            Limit::Max(max) => amount <= *max,
        }
    }

    pub fn max(&self) -> Option<u64> {
        match self {
            Limit::Unlimited => None,
            Limit::Max(max) => Some(*max),
        }
    }
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Limit::Unlimited => f.write_str("unlimited"),
            Limit::Max(max) => write!(f, "{max}"),
        }
    }
}

impl Serialize for Limit {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Limit::Unlimited => serializer.serialize_str("unlimited"),
            Limit::Max(max) => serializer.serialize_u64(*max),
        }
    }
}

impl<'de> Deserialize<'de> for Limit {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(max) => Ok(Limit::Max(max)),
            Raw::Text(text) if text.eq_ignore_ascii_case("unlimited") => Ok(Limit::Unlimited),
            Raw::Text(text) => Err(serde::de::Error::custom(format!(
                "invalid limit '{text}': expected a non-negative integer or \"unlimited\""
            ))),
        }
    }
}

/// Ceilings enforced around every capability invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ResourceLimits {
    /// Peak resident memory per invocation, in bytes.
    pub max_memory_bytes: Limit,
    /// CPU share per invocation, in percent of one core.
    pub max_cpu_percent: Limit,
    /// Cumulative disk usage per plugin, in bytes.
    pub max_disk_bytes: Limit,
    /// Cumulative network I/O per plugin, in bytes.
    pub max_network_bytes: Limit,
    /// Wall-clock budget per invocation, in milliseconds.
    pub max_execution_time_ms: Limit,
    /// Simultaneous invocations per plugin.
    pub max_concurrency: Limit,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_bytes: Limit::Max(512 * 1024 * 1024),
            max_cpu_percent: Limit::Max(100),
            max_disk_bytes: Limit::Max(1024 * 1024 * 1024),
            max_network_bytes: Limit::Max(100 * 1024 * 1024),
            max_execution_time_ms: Limit::Max(30_000),
            max_concurrency: Limit::Max(4),
        }
    }
}

impl ResourceLimits {
    pub fn unlimited() -> Self {
        Self {
            max_memory_bytes: Limit::Unlimited,
            max_cpu_percent: Limit::Unlimited,
            max_disk_bytes: Limit::Unlimited,
            max_network_bytes: Limit::Unlimited,
            max_execution_time_ms: Limit::Unlimited,
            max_concurrency: Limit::Unlimited,
        }
    }

    pub fn execution_timeout(&self) -> Option<Duration> {
        self.max_execution_time_ms.max().map(Duration::from_millis)
    }

    /// Config names of limits set to zero.
    pub fn disabled_fields(&self) -> Vec<&'static str> {
        [
            ("maxMemoryBytes", self.max_memory_bytes),
            ("maxCpuPercent", self.max_cpu_percent),
            ("maxDiskBytes", self.max_disk_bytes),
            ("maxNetworkBytes", self.max_network_bytes),
            ("maxExecutionTimeMs", self.max_execution_time_ms),
            ("maxConcurrency", self.max_concurrency),
        ]
        .into_iter()
        .filter(|(_, limit)| limit.is_disabled())
        .map(|(name, _)| name)
        .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_is_disabled_not_unlimited() {
        let zero = Limit::Max(0);
        assert!(zero.is_disabled());
        assert!(!zero.permits(1));
        assert!(Limit::Unlimited.permits(u64::MAX));
        assert!(!Limit::Unlimited.is_disabled());
    }

    #[test]
    fn parses_numbers_and_sentinel() {
        let limits: ResourceLimits = serde_json::from_value(serde_json::json!({
            "maxConcurrency": 1,
            "maxExecutionTimeMs": "unlimited"
        }))
        .unwrap();
        assert_eq!(limits.max_concurrency, Limit::Max(1));
        assert_eq!(limits.max_execution_time_ms, Limit::Unlimited);
        assert_eq!(limits.execution_timeout(), None);
        // Unspecified fields keep their defaults.
        assert_eq!(limits.max_cpu_percent, Limit::Max(100));
    }

    #[test]
    fn rejects_unknown_keyword() {
        let parsed: Result<Limit, _> = serde_json::from_value(serde_json::json!("infinite"));
        assert!(parsed.is_err());
    }

    #[test]
    fn reports_disabled_fields() {
        let limits = ResourceLimits {
            max_network_bytes: Limit::Max(0),
            ..ResourceLimits::unlimited()
        };
        assert_eq!(limits.disabled_fields(), vec!["maxNetworkBytes"]);
    }
}
