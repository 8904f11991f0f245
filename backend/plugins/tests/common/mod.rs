#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;

use warden_core::{
    CapabilityDescriptor, CapabilityPlugin, HealthProbe, HealthStatus, InvocationContext,
    PluginDescriptor, PluginError, PluginHealth, PluginInstance, PluginStatus,
};
use warden_plugins::{InlineRepository, ManagerOptions, PluginLoader, PluginManager, PluginRegistry};
use warden_sandbox::ResourceSandbox;

pub const ENTRY: &str = "test:scripted";
pub const CAPABILITY: &str = "run";

/// Capability double that counts calls and can stall for a fixed time.
#[derive(Default)]
pub struct Scripted {
    pub delay: Duration,
    pub init_delay: Duration,
    pub panics: bool,
    pub calls: AtomicUsize,
    pub completed: AtomicUsize,
    pub cleanups: AtomicUsize,
}

impl Scripted {
    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn slow_init(init_delay: Duration) -> Self {
        Self {
            init_delay,
            ..Default::default()
        }
    }

    /// `execute` panics after counting the call.
    pub fn panicking() -> Self {
        Self {
            panics: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CapabilityPlugin for Scripted {
    async fn initialize(&self, _config: serde_json::Value) -> Result<()> {
        if !self.init_delay.is_zero() {
            tokio::time::sleep(self.init_delay).await;
        }
        Ok(())
    }

    async fn execute(
        &self,
        _ctx: &InvocationContext,
        _capability: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, PluginError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.panics {
            panic!("scripted plugin bug");
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(params)
    }

    fn capabilities(&self) -> Vec<CapabilityDescriptor> {
        vec![CapabilityDescriptor::new(CAPABILITY)]
    }

    fn status(&self) -> PluginStatus {
        PluginStatus::Active
    }

    async fn cleanup(&self) -> Result<()> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Probe that always answers with a fixed status, optionally after a stall.
pub struct FixedProbe {
    pub status: HealthStatus,
    pub delay: Duration,
}

impl FixedProbe {
    pub fn unhealthy() -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            delay: Duration::ZERO,
        }
    }

    pub fn stalled(delay: Duration) -> Self {
        Self {
            status: HealthStatus::Healthy,
            delay,
        }
    }
}

#[async_trait]
impl HealthProbe for FixedProbe {
    async fn check_health(&self, _deadline: Instant) -> PluginHealth {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        PluginHealth::new(self.status, "fixed", chrono::Utc::now())
    }
}

pub fn descriptor(id: &str) -> PluginDescriptor {
    PluginDescriptor::new(id, ENTRY).with_capability(CapabilityDescriptor::new(CAPABILITY))
}

/// Options with the background monitor off; tests drive cycles by hand.
pub fn quiet_options() -> ManagerOptions {
    let mut options = ManagerOptions::default();
    options.health.enabled = false;
    options
}

pub struct Harness {
    ids: Vec<String>,
    plugin: Arc<Scripted>,
    probe: Option<Arc<dyn HealthProbe>>,
    sandbox: Option<Arc<ResourceSandbox>>,
    options: ManagerOptions,
}

impl Harness {
    pub fn new(plugin: Arc<Scripted>) -> Self {
        Self {
            ids: vec!["scripted".to_string()],
            plugin,
            probe: None,
            sandbox: None,
            options: quiet_options(),
        }
    }

    pub fn ids<I: IntoIterator<Item = S>, S: Into<String>>(mut self, ids: I) -> Self {
        self.ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    pub fn sandbox(mut self, sandbox: ResourceSandbox) -> Self {
        self.sandbox = Some(Arc::new(sandbox));
        self
    }

    pub fn options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> PluginManager {
        let mut repo = InlineRepository::new("test", 0);
        for id in &self.ids {
            repo = repo.with_descriptor(descriptor(id));
        }
        let mut registry = PluginRegistry::new();
        registry.add_repository(Arc::new(repo));

        let mut loader = PluginLoader::new(Arc::new(registry));
        let plugin = self.plugin;
        let probe = self.probe;
        loader.register_factory(ENTRY, move |_: &PluginDescriptor| -> Result<PluginInstance> {
            let instance = PluginInstance::new(plugin.clone());
            Ok(match &probe {
                Some(probe) => instance.with_probe(probe.clone()),
                None => instance,
            })
        });

        let mut builder = PluginManager::builder(Arc::new(loader)).options(self.options);
        if let Some(sandbox) = self.sandbox {
            builder = builder.sandbox(sandbox);
        }
        builder.build()
    }
}
