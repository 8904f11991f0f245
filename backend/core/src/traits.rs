use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::Instant;

use crate::context::InvocationContext;
use crate::error::PluginError;
use crate::types::{CapabilityDescriptor, PluginHealth, PluginStatus};

/// Contract every loaded plugin satisfies.
///
/// The manager owns each instance; only the manager and the sandbox invoke it.
#[async_trait]
pub trait CapabilityPlugin: Send + Sync {
    /// One-time setup with the plugin's resolved configuration.
    async fn initialize(&self, config: serde_json::Value) -> Result<()>;

    /// Run a declared capability.
    ///
    /// Returns `PluginError::UnsupportedCapability` for undeclared names.
    async fn execute(
        &self,
        ctx: &InvocationContext,
        capability: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, PluginError>;

    fn capabilities(&self) -> Vec<CapabilityDescriptor>;

    /// The plugin's own view of its status.
    fn status(&self) -> PluginStatus;

    /// Best-effort teardown. Errors are logged by the caller, never propagated.
    async fn cleanup(&self) -> Result<()>;
}

/// Self-check supplied by plugins that expose health information.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Produce a snapshot. Implementations should return before `deadline`.
    async fn check_health(&self, deadline: Instant) -> PluginHealth;
}

/// A freshly instantiated plugin: the contract plus an optional probe.
///
/// A type implementing both traits can hand out the same `Arc` twice.
pub struct PluginInstance {
    pub contract: Arc<dyn CapabilityPlugin>,
    pub probe: Option<Arc<dyn HealthProbe>>,
}

impl PluginInstance {
    pub fn new(contract: Arc<dyn CapabilityPlugin>) -> Self {
        Self {
            contract,
            probe: None,
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }
}

/// Wall-clock source, injected so timestamps are testable.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}
