//! Built-in plugins shipped with the host.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tracing::debug;

use warden_core::{
    CapabilityDescriptor, CapabilityPlugin, HealthProbe, InvocationContext, PluginDescriptor,
    PluginError, PluginHealth, PluginInstance, PluginStatus,
};

use crate::loader::PluginLoader;

pub const ECHO_ENTRY: &str = "builtin:echo";

/// Returns its parameters verbatim from the `echo` capability.
pub struct EchoPlugin {
    status: Mutex<PluginStatus>,
    invocations: AtomicU64,
}

impl Default for EchoPlugin {
    fn default() -> Self {
        Self {
            status: Mutex::new(PluginStatus::Loading),
            invocations: AtomicU64::new(0),
        }
    }
}

impl EchoPlugin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn invocations(&self) -> u64 {
        self.invocations.load(Ordering::Relaxed)
    }

    fn set_status(&self, status: PluginStatus) {
        if let Ok(mut current) = self.status.lock() {
            *current = status;
        }
    }
}

#[async_trait]
impl CapabilityPlugin for EchoPlugin {
    async fn initialize(&self, config: serde_json::Value) -> Result<()> {
        debug!(config = %config, "Echo plugin initialized");
        self.set_status(PluginStatus::Active);
        Ok(())
    }

    async fn execute(
        &self,
        ctx: &InvocationContext,
        capability: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, PluginError> {
        if capability != "echo" {
            return Err(PluginError::UnsupportedCapability {
                plugin: ctx.plugin_id().to_string(),
                capability: capability.to_string(),
            });
        }
        let size = serde_json::to_vec(&params).map(|b| b.len()).unwrap_or(0);
        ctx.record_memory(size as u64)?;
        self.invocations.fetch_add(1, Ordering::Relaxed);
        Ok(params)
    }

    fn capabilities(&self) -> Vec<CapabilityDescriptor> {
        vec![echo_capability()]
    }

    fn status(&self) -> PluginStatus {
        self.status
            .lock()
            .map(|s| *s)
            .unwrap_or(PluginStatus::Error)
    }

    async fn cleanup(&self) -> Result<()> {
        self.set_status(PluginStatus::Unloading);
        Ok(())
    }
}

#[async_trait]
impl HealthProbe for EchoPlugin {
    async fn check_health(&self, _deadline: Instant) -> PluginHealth {
        PluginHealth::healthy(chrono::Utc::now())
            .with_metric("invocations", self.invocations() as f64)
    }
}

fn echo_capability() -> CapabilityDescriptor {
    let mut capability = CapabilityDescriptor::new("echo");
    capability.description = "Return the parameters unchanged".to_string();
    capability
}

/// Descriptor for the echo plugin under `id`.
pub fn echo_descriptor(id: &str) -> PluginDescriptor {
    let mut descriptor = PluginDescriptor::new(id, ECHO_ENTRY).with_capability(echo_capability());
    descriptor.name = "Echo".to_string();
    descriptor.description = "Reference plugin that echoes its input".to_string();
    descriptor
}

/// Register factories for every built-in entry point.
pub fn register_builtins(loader: &mut PluginLoader) {
    loader.register_factory(ECHO_ENTRY, |_: &PluginDescriptor| -> Result<PluginInstance> {
        let plugin = Arc::new(EchoPlugin::new());
        Ok(PluginInstance::new(plugin.clone()).with_probe(plugin))
    });
}
