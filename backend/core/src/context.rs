//! Per-invocation context handed to a plugin's `execute`.
//!
//! Plugins route outbound API calls and resource consumption through the
//! context so the sandbox can gate them.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::PluginError;
use crate::types::{PluginId, ResourceKind};

/// Enforcement hook behind an [`InvocationContext`].
pub trait InvocationGuard: Send + Sync {
    /// Check an outbound API name against the allow-list.
    fn authorize_api(&self, api: &str) -> Result<(), PluginError>;

    /// Account `amount` units of `resource` (bytes, or microseconds for CPU).
    fn record(&self, resource: ResourceKind, amount: u64) -> Result<(), PluginError>;
}

/// Guard used when sandboxing is disabled.
pub struct Unrestricted;

impl InvocationGuard for Unrestricted {
    fn authorize_api(&self, _api: &str) -> Result<(), PluginError> {
        Ok(())
    }

    fn record(&self, _resource: ResourceKind, _amount: u64) -> Result<(), PluginError> {
        Ok(())
    }
}

#[derive(Clone)]
pub struct InvocationContext {
    plugin_id: PluginId,
    capability: String,
    cancel: CancellationToken,
    guard: Arc<dyn InvocationGuard>,
}

impl InvocationContext {
    pub fn new(
        plugin_id: impl Into<PluginId>,
        capability: impl Into<String>,
        cancel: CancellationToken,
        guard: Arc<dyn InvocationGuard>,
    ) -> Self {
        Self {
            plugin_id: plugin_id.into(),
            capability: capability.into(),
            cancel,
            guard,
        }
    }

    /// A context with no enforcement and a fresh cancellation token.
    pub fn unrestricted(plugin_id: impl Into<PluginId>, capability: impl Into<String>) -> Self {
        Self::new(
            plugin_id,
            capability,
            CancellationToken::new(),
            Arc::new(Unrestricted),
        )
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    pub fn capability(&self) -> &str {
        &self.capability
    }

    /// Fires when the invocation is timed out, cancelled, or breaches a limit.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Must be called before any outbound call to a named API.
    pub fn authorize_api(&self, api: &str) -> Result<(), PluginError> {
        self.guard.authorize_api(api)
    }

    /// Report current resident memory in bytes.
    pub fn record_memory(&self, bytes: u64) -> Result<(), PluginError> {
        self.guard.record(ResourceKind::Memory, bytes)
    }

    /// Report CPU time consumed since the last report.
    pub fn record_cpu(&self, cpu_time: Duration) -> Result<(), PluginError> {
        let micros = u64::try_from(cpu_time.as_micros()).unwrap_or(u64::MAX);
        self.guard.record(ResourceKind::Cpu, micros)
    }

    /// Report bytes written to disk.
    pub fn record_disk(&self, bytes: u64) -> Result<(), PluginError> {
        self.guard.record(ResourceKind::Disk, bytes)
    }

    /// Report bytes sent or received over the network.
    pub fn record_network(&self, bytes: u64) -> Result<(), PluginError> {
        self.guard.record(ResourceKind::Network, bytes)
    }
}

impl std::fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InvocationContext")
            .field("plugin_id", &self.plugin_id)
            .field("capability", &self.capability)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}
