//! Resource accounting for a single invocation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use warden_core::{InvocationGuard, Limit, PluginError, PluginId, ResourceKind, ResourceLimits};

use crate::allowlist::ApiAllowlist;

/// CPU share is not judged before this much wall-clock time has passed.
const CPU_SAMPLE_FLOOR: Duration = Duration::from_millis(10);

/// Cumulative per-plugin quota usage; survives across invocations.
#[derive(Debug, Default)]
pub struct QuotaUsage {
    disk_bytes: AtomicU64,
    network_bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaSnapshot {
    pub disk_bytes: u64,
    pub network_bytes: u64,
}

impl QuotaUsage {
    pub fn snapshot(&self) -> QuotaSnapshot {
        QuotaSnapshot {
            disk_bytes: self.disk_bytes.load(Ordering::Relaxed),
            network_bytes: self.network_bytes.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.disk_bytes.store(0, Ordering::Relaxed);
        self.network_bytes.store(0, Ordering::Relaxed);
    }
}

/// Guard installed behind the `InvocationContext` of a sandboxed call.
///
/// The first violation is latched so the sandbox can fail the invocation
/// even if the plugin swallows the error it was handed.
pub struct InvocationMeter {
    plugin_id: PluginId,
    limits: ResourceLimits,
    allowlist: Arc<ApiAllowlist>,
    quota: Arc<QuotaUsage>,
    started: Instant,
    peak_memory: AtomicU64,
    cpu_micros: AtomicU64,
    violation: Mutex<Option<PluginError>>,
    cancel: CancellationToken,
}

impl InvocationMeter {
    pub fn new(
        plugin_id: impl Into<PluginId>,
        limits: ResourceLimits,
        allowlist: Arc<ApiAllowlist>,
        quota: Arc<QuotaUsage>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            limits,
            allowlist,
            quota,
            started: Instant::now(),
            peak_memory: AtomicU64::new(0),
            cpu_micros: AtomicU64::new(0),
            violation: Mutex::new(None),
            cancel,
        }
    }

    pub fn peak_memory(&self) -> u64 {
        self.peak_memory.load(Ordering::Relaxed)
    }

    /// Remove and return the latched violation, if any.
    pub fn take_violation(&self) -> Option<PluginError> {
        self.violation
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    /// Final CPU-share check once the call has returned.
    pub fn finish(&self) -> Result<(), PluginError> {
        let total = self.cpu_micros.load(Ordering::Relaxed);
        self.check_cpu(total, true)
    }

    fn breach(&self, make: impl Fn() -> PluginError) -> Result<(), PluginError> {
        {
            let mut slot = self
                .violation
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            if slot.is_none() {
                *slot = Some(make());
            }
        }
        let err = make();
        warn!(plugin = %self.plugin_id, error = %err, "Sandbox violation");
        self.cancel.cancel();
        Err(err)
    }

    fn check(&self, resource: ResourceKind, limit: Limit, used: u64) -> Result<(), PluginError> {
        match limit {
            Limit::Max(max) if used > max => self.breach(|| PluginError::ResourceLimitExceeded {
                plugin: self.plugin_id.clone(),
                resource,
                used,
                limit: max,
            }),
            _ => Ok(()),
        }
    }

    fn check_cpu(&self, total_micros: u64, completed: bool) -> Result<(), PluginError> {
        let elapsed = self.started.elapsed();
        if !completed && elapsed < CPU_SAMPLE_FLOOR {
            return Ok(());
        }
        let elapsed_micros = u64::try_from(elapsed.as_micros()).unwrap_or(u64::MAX).max(1);
        let share = total_micros.saturating_mul(100) / elapsed_micros;
        self.check(ResourceKind::Cpu, self.limits.max_cpu_percent, share)
    }
}

/// Add to a counter, pinning at `u64::MAX`. Returns the new total.
fn accumulate(counter: &AtomicU64, amount: u64) -> u64 {
    let previous = counter
        .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
            Some(v.saturating_add(amount))
        })
        .unwrap_or_else(|v| v);
    previous.saturating_add(amount)
}

impl InvocationGuard for InvocationMeter {
    fn authorize_api(&self, api: &str) -> Result<(), PluginError> {
        if self.allowlist.permits(api) {
            return Ok(());
        }
        self.breach(|| PluginError::ApiForbidden {
            plugin: self.plugin_id.clone(),
            api: api.to_string(),
        })
    }

    fn record(&self, resource: ResourceKind, amount: u64) -> Result<(), PluginError> {
        match resource {
            ResourceKind::Memory => {
                self.peak_memory.fetch_max(amount, Ordering::Relaxed);
                self.check(resource, self.limits.max_memory_bytes, amount)
            }
            ResourceKind::Cpu => {
                let total = accumulate(&self.cpu_micros, amount);
                self.check_cpu(total, false)
            }
            ResourceKind::Disk => {
                let total = accumulate(&self.quota.disk_bytes, amount);
                self.check(resource, self.limits.max_disk_bytes, total)
            }
            ResourceKind::Network => {
                let total = accumulate(&self.quota.network_bytes, amount);
                self.check(resource, self.limits.max_network_bytes, total)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meter(limits: ResourceLimits, apis: &[&str]) -> InvocationMeter {
        InvocationMeter::new(
            "vision",
            limits,
            Arc::new(ApiAllowlist::from_patterns(apis.iter().copied())),
            Arc::new(QuotaUsage::default()),
            CancellationToken::new(),
        )
    }

    #[test]
    fn forbidden_api_is_latched_and_cancels() {
        let m = meter(ResourceLimits::unlimited(), &["http.get"]);
        assert!(m.authorize_api("http.get").is_ok());
        let err = m.authorize_api("shell.exec").unwrap_err();
        assert!(matches!(err, PluginError::ApiForbidden { .. }));
        assert!(m.cancel.is_cancelled());
        assert!(matches!(
            m.take_violation(),
            Some(PluginError::ApiForbidden { ref api, .. }) if api == "shell.exec"
        ));
        assert!(m.take_violation().is_none());
    }

    #[test]
    fn memory_ceiling_is_per_report_peak() {
        let limits = ResourceLimits {
            max_memory_bytes: Limit::Max(1_000),
            ..ResourceLimits::unlimited()
        };
        let m = meter(limits, &[]);
        assert!(m.record(ResourceKind::Memory, 800).is_ok());
        assert!(m.record(ResourceKind::Memory, 900).is_ok());
        assert_eq!(m.peak_memory(), 900);
        let err = m.record(ResourceKind::Memory, 1_001).unwrap_err();
        assert!(matches!(
            err,
            PluginError::ResourceLimitExceeded { resource: ResourceKind::Memory, used: 1_001, limit: 1_000, .. }
        ));
    }

    #[test]
    fn network_quota_accumulates() {
        let limits = ResourceLimits {
            max_network_bytes: Limit::Max(100),
            ..ResourceLimits::unlimited()
        };
        let m = meter(limits, &[]);
        assert!(m.record(ResourceKind::Network, 60).is_ok());
        assert!(m.record(ResourceKind::Network, 60).is_err());
        assert_eq!(m.quota.snapshot().network_bytes, 120);
    }

    #[test]
    fn quota_saturates_instead_of_wrapping() {
        let limits = ResourceLimits {
            max_network_bytes: Limit::Max(100),
            ..ResourceLimits::unlimited()
        };
        let m = meter(limits, &[]);
        assert!(m.record(ResourceKind::Network, u64::MAX).is_err());
        let err = m.record(ResourceKind::Network, 1).unwrap_err();
        assert!(matches!(
            err,
            PluginError::ResourceLimitExceeded { resource: ResourceKind::Network, used: u64::MAX, limit: 100, .. }
        ));
        assert_eq!(m.quota.snapshot().network_bytes, u64::MAX);
    }

    #[test]
    fn cpu_total_saturates() {
        let m = meter(ResourceLimits::unlimited(), &[]);
        assert!(m.record(ResourceKind::Cpu, u64::MAX).is_ok());
        assert!(m.record(ResourceKind::Cpu, 1).is_ok());
        assert_eq!(m.cpu_micros.load(Ordering::Relaxed), u64::MAX);
    }

    #[test]
    fn disabled_disk_rejects_any_write() {
        let limits = ResourceLimits {
            max_disk_bytes: Limit::Max(0),
            ..ResourceLimits::unlimited()
        };
        let m = meter(limits, &[]);
        assert!(m.record(ResourceKind::Disk, 1).is_err());
    }

    #[test]
    fn cpu_share_checked_on_finish() {
        let limits = ResourceLimits {
            max_cpu_percent: Limit::Max(50),
            ..ResourceLimits::unlimited()
        };
        let m = meter(limits, &[]);
        // Ten seconds of CPU reported within a few microseconds of wall time.
        assert!(m.record(ResourceKind::Cpu, 10_000_000).is_ok());
        assert!(matches!(
            m.finish(),
            Err(PluginError::ResourceLimitExceeded { resource: ResourceKind::Cpu, .. })
        ));
    }
}
