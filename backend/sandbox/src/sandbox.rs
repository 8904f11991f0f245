//! Resource sandbox: gates and bounds every capability invocation.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warden_core::{InvocationContext, Limit, PluginError, PluginId, ResourceLimits};

use crate::allowlist::ApiAllowlist;
use crate::meter::{InvocationMeter, QuotaSnapshot, QuotaUsage};

/// Per-plugin gate state, created on first use and dropped on `release`.
struct PluginSlot {
    /// `None` when concurrency is unlimited.
    semaphore: Option<Arc<Semaphore>>,
    capacity: u64,
    quota: Arc<QuotaUsage>,
}

/// Wraps capability calls with concurrency, timeout, API, and resource enforcement.
///
/// The concurrency gate rejects rather than queues: a call that finds every
/// slot taken fails immediately with `ConcurrencyLimitExceeded`.
pub struct ResourceSandbox {
    defaults: ResourceLimits,
    overrides: HashMap<PluginId, ResourceLimits>,
    allowlist: Arc<ApiAllowlist>,
    slots: Mutex<HashMap<PluginId, PluginSlot>>,
}

impl ResourceSandbox {
    pub fn new(defaults: ResourceLimits, allowlist: ApiAllowlist) -> Self {
        info!(
            concurrency = %defaults.max_concurrency,
            timeout_ms = %defaults.max_execution_time_ms,
            rules = allowlist.rules.len(),
            "Resource sandbox initialized"
        );
        Self {
            defaults,
            overrides: HashMap::new(),
            allowlist: Arc::new(allowlist),
            slots: Mutex::new(HashMap::new()),
        }
    }

    /// Use `limits` instead of the defaults for one plugin.
    pub fn with_override(mut self, plugin_id: impl Into<PluginId>, limits: ResourceLimits) -> Self {
        self.overrides.insert(plugin_id.into(), limits);
        self
    }

    pub fn limits_for(&self, plugin_id: &str) -> &ResourceLimits {
        self.overrides.get(plugin_id).unwrap_or(&self.defaults)
    }

    pub fn allowlist(&self) -> &ApiAllowlist {
        &self.allowlist
    }

    /// Invocations currently holding a concurrency slot.
    pub fn in_flight(&self, plugin_id: &str) -> u64 {
        let slots = self.lock_slots();
        match slots.get(plugin_id) {
            Some(PluginSlot {
                semaphore: Some(sem),
                capacity,
                ..
            }) => capacity.saturating_sub(sem.available_permits() as u64),
            _ => 0,
        }
    }

    pub fn usage(&self, plugin_id: &str) -> QuotaSnapshot {
        self.lock_slots()
            .get(plugin_id)
            .map(|slot| slot.quota.snapshot())
            .unwrap_or_default()
    }

    /// Zero the cumulative disk and network quotas of a plugin.
    pub fn reset_usage(&self, plugin_id: &str) {
        if let Some(slot) = self.lock_slots().get(plugin_id) {
            slot.quota.reset();
        }
    }

    /// Forget all state kept for a plugin (called on unload).
    pub fn release(&self, plugin_id: &str) {
        if self.lock_slots().remove(plugin_id).is_some() {
            debug!(plugin = %plugin_id, "Sandbox state released");
        }
    }

    /// Run `call` under the plugin's limits.
    ///
    /// The concurrency permit is held by this future, so it is returned on
    /// every exit path, including when the caller drops the future.
    pub async fn run<F, Fut>(
        &self,
        plugin_id: &str,
        capability: &str,
        cancel: &CancellationToken,
        call: F,
    ) -> Result<serde_json::Value, PluginError>
    where
        F: FnOnce(InvocationContext) -> Fut,
        Fut: Future<Output = Result<serde_json::Value, PluginError>> + Send,
    {
        let limits = self.limits_for(plugin_id).clone();
        let (semaphore, capacity, quota) = self.slot(plugin_id, &limits);

        let _permit = match semaphore {
            Some(sem) => Some(sem.try_acquire_owned().map_err(|_| {
                warn!(plugin = %plugin_id, limit = capacity, "Concurrency limit reached");
                PluginError::ConcurrencyLimitExceeded {
                    plugin: plugin_id.to_string(),
                    limit: capacity,
                }
            })?),
            None => None,
        };

        let timeout = limits.execution_timeout();
        if limits.max_execution_time_ms.is_disabled() {
            return Err(PluginError::ExecutionTimeout {
                plugin: plugin_id.to_string(),
                timeout: std::time::Duration::ZERO,
            });
        }

        let token = cancel.child_token();
        let meter = Arc::new(InvocationMeter::new(
            plugin_id,
            limits,
            self.allowlist.clone(),
            quota,
            token.clone(),
        ));
        let ctx = InvocationContext::new(plugin_id, capability, token.clone(), meter.clone());
        let invocation = call(ctx);

        let bounded = async {
            match timeout {
                Some(limit) => tokio::time::timeout(limit, invocation).await.ok(),
                None => Some(invocation.await),
            }
        };

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PluginError::Cancelled {
                plugin: plugin_id.to_string(),
            }),
            _ = token.cancelled() => Err(PluginError::Cancelled {
                plugin: plugin_id.to_string(),
            }),
            result = bounded => match result {
                Some(result) => result,
                None => {
                    token.cancel();
                    warn!(plugin = %plugin_id, capability = %capability, ?timeout, "Invocation timed out");
                    Err(PluginError::ExecutionTimeout {
                        plugin: plugin_id.to_string(),
                        timeout: timeout.unwrap_or_default(),
                    })
                }
            },
        };

        if let Some(violation) = meter.take_violation() {
            return Err(violation);
        }
        let value = outcome?;
        meter.finish()?;
        Ok(value)
    }

    fn slot(
        &self,
        plugin_id: &str,
        limits: &ResourceLimits,
    ) -> (Option<Arc<Semaphore>>, u64, Arc<QuotaUsage>) {
        let mut slots = self.lock_slots();
        let slot = slots.entry(plugin_id.to_string()).or_insert_with(|| {
            let (semaphore, capacity) = match limits.max_concurrency {
                Limit::Unlimited => (None, u64::MAX),
                Limit::Max(max) => {
                    let permits = usize::try_from(max)
                        .unwrap_or(Semaphore::MAX_PERMITS)
                        .min(Semaphore::MAX_PERMITS);
                    (Some(Arc::new(Semaphore::new(permits))), max)
                }
            };
            PluginSlot {
                semaphore,
                capacity,
                quota: Arc::new(QuotaUsage::default()),
            }
        });
        (slot.semaphore.clone(), slot.capacity, slot.quota.clone())
    }

    fn lock_slots(&self) -> std::sync::MutexGuard<'_, HashMap<PluginId, PluginSlot>> {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
