//! Plugin manager
//!
//! Owns the table of managed plugins and exposes the public lifecycle and
//! invocation surface. Table lookups take the shared lock, mutations take the
//! exclusive lock, and capability calls run outside both.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use serde::Serialize;
use serde_json::json;
use tokio::sync::{broadcast, Mutex, OwnedRwLockWriteGuard, RwLock};
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use warden_config::WardenConfig;
use warden_core::{
    CapabilityPlugin, Clock, HealthProbe, InvocationContext, LoadError, PluginDescriptor,
    PluginError, PluginEvent, PluginEventKind, PluginId, PluginRecord, PluginStatus, SystemClock,
    Unrestricted, UsageStats,
};
use warden_sandbox::ResourceSandbox;

use crate::event_bus::EventBus;
use crate::health::{self, HealthMonitor, HealthOptions};
use crate::lifecycle;
use crate::loader::{LoadedPlugin, PluginLoader};
use crate::registry::{PluginRegistry, SyncReport};

#[derive(Debug, Clone)]
pub struct ManagerOptions {
    /// Move freshly loaded plugins straight to Active.
    pub auto_activate: bool,
    /// How long unload waits for in-flight invocations before cleanup.
    pub unload_drain_timeout: Duration,
    /// Plugins loaded by `start`.
    pub autoload: Vec<PluginId>,
    pub health: HealthOptions,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            auto_activate: true,
            unload_drain_timeout: Duration::from_secs(5),
            autoload: Vec::new(),
            health: HealthOptions::default(),
        }
    }
}

impl ManagerOptions {
    pub fn from_config(config: &WardenConfig) -> Self {
        let plugins = config.plugins();
        Self {
            auto_activate: plugins.auto_activate(),
            unload_drain_timeout: plugins.unload_drain_timeout(),
            autoload: plugins.autoload.clone(),
            health: HealthOptions::from_config(&config.health()),
        }
    }
}

/// A table row: the record handed out as copies, plus the live instance.
pub(crate) struct PluginEntry {
    pub(crate) record: PluginRecord,
    pub(crate) instance: Option<Arc<dyn CapabilityPlugin>>,
    pub(crate) probe: Option<Arc<dyn HealthProbe>>,
    /// Held shared by each invocation, exclusively by a pending load and by
    /// unload while draining.
    pub(crate) gate: Arc<RwLock<()>>,
    pub(crate) unhealthy_streak: u32,
}

impl PluginEntry {
    /// Placeholder inserted while the loader runs.
    fn reserve(id: &str, at: chrono::DateTime<chrono::Utc>) -> Self {
        Self {
            record: PluginRecord {
                id: id.to_string(),
                descriptor: PluginDescriptor::new(id, ""),
                status: PluginStatus::Loading,
                capabilities: Vec::new(),
                usage: UsageStats::default(),
                health: None,
                has_health_probe: false,
                loaded_at: at,
                error: None,
            },
            instance: None,
            probe: None,
            gate: Arc::new(RwLock::new(())),
            unhealthy_streak: 0,
        }
    }
}

/// State shared with the health monitor task.
pub(crate) struct Shared {
    pub(crate) table: RwLock<HashMap<PluginId, PluginEntry>>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) events: EventBus,
}

impl Shared {
    pub(crate) fn emit(&self, plugin_id: &str, kind: PluginEventKind, payload: serde_json::Value) {
        self.events
            .publish(PluginEvent::new(plugin_id, kind, self.clock.now(), payload));
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoloadFailure {
    pub plugin: PluginId,
    pub message: String,
}

/// Outcome of `start`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartReport {
    pub sync: SyncReport,
    pub loaded: Vec<PluginId>,
    pub failed: Vec<AutoloadFailure>,
}

pub struct PluginManagerBuilder {
    loader: Arc<PluginLoader>,
    sandbox: Option<Arc<ResourceSandbox>>,
    clock: Arc<dyn Clock>,
    options: ManagerOptions,
}

impl PluginManagerBuilder {
    /// Enforce limits around every invocation; without a sandbox calls run unrestricted.
    pub fn sandbox(mut self, sandbox: Arc<ResourceSandbox>) -> Self {
        self.sandbox = Some(sandbox);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn options(mut self, options: ManagerOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> PluginManager {
        PluginManager {
            shared: Arc::new(Shared {
                table: RwLock::new(HashMap::new()),
                clock: self.clock,
                events: EventBus::new(),
            }),
            registry: self.loader.registry().clone(),
            loader: self.loader,
            sandbox: self.sandbox,
            options: self.options,
            monitor: Mutex::new(None),
        }
    }
}

pub struct PluginManager {
    shared: Arc<Shared>,
    registry: Arc<PluginRegistry>,
    loader: Arc<PluginLoader>,
    sandbox: Option<Arc<ResourceSandbox>>,
    options: ManagerOptions,
    monitor: Mutex<Option<HealthMonitor>>,
}

impl PluginManager {
    pub fn builder(loader: Arc<PluginLoader>) -> PluginManagerBuilder {
        PluginManagerBuilder {
            loader,
            sandbox: None,
            clock: Arc::new(SystemClock),
            options: ManagerOptions::default(),
        }
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    pub fn sandbox(&self) -> Option<&Arc<ResourceSandbox>> {
        self.sandbox.as_ref()
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.options
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.shared.events.subscribe()
    }

    // -----------------------------------------------------------------------
    // Manager lifecycle
    // -----------------------------------------------------------------------

    /// Sync the registry, load the autoload set, and launch the health monitor.
    ///
    /// Every step is best-effort. A second call does not spawn a second monitor.
    pub async fn start(&self) -> StartReport {
        let sync = self.registry.sync().await;
        for failure in &sync.failures {
            let err = PluginError::from(failure.clone());
            warn!(error = %err, "Repository unavailable at start");
        }

        let mut report = StartReport {
            sync,
            ..Default::default()
        };
        for id in &self.options.autoload {
            match self.load(id).await {
                Ok(_) => report.loaded.push(id.clone()),
                Err(e) => {
                    warn!(plugin = %id, error = %e, "Autoload failed");
                    report.failed.push(AutoloadFailure {
                        plugin: id.clone(),
                        message: e.to_string(),
                    });
                }
            }
        }

        let mut monitor = self.monitor.lock().await;
        if !self.options.health.enabled {
            debug!("Health monitor disabled");
        } else if monitor.is_some() {
            debug!("Health monitor already running");
        } else {
            *monitor = Some(HealthMonitor::spawn(
                self.shared.clone(),
                self.options.health.clone(),
            ));
        }

        info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            "Plugin manager started"
        );
        report
    }

    /// Halt the health monitor, then unload every plugin best-effort.
    pub async fn stop(&self) {
        let monitor = self.monitor.lock().await.take();
        if let Some(monitor) = monitor {
            monitor.stop().await;
        }

        let entries: Vec<(PluginId, Arc<RwLock<()>>, bool)> = self
            .shared
            .table
            .read()
            .await
            .iter()
            .map(|(id, e)| {
                let loading = e.record.status == PluginStatus::Loading;
                (id.clone(), e.gate.clone(), loading)
            })
            .collect();
        for (id, gate, loading) in entries {
            if loading {
                // A pending load holds the gate until it commits or gives up.
                drop(gate.write().await);
            }
            match self.unload(&id).await {
                Ok(()) => {}
                Err(PluginError::NotFound(_)) => debug!(plugin = %id, "Pending load did not complete"),
                Err(e) => warn!(plugin = %id, error = %e, "Unload during shutdown failed"),
            }
        }
        info!("Plugin manager stopped");
    }

    pub async fn is_monitoring(&self) -> bool {
        self.monitor.lock().await.is_some()
    }

    /// Run one health cycle now. Returns the number of plugins probed.
    pub async fn run_health_cycle(&self) -> usize {
        health::run_cycle(&self.shared, &self.options.health).await
    }

    // -----------------------------------------------------------------------
    // Load / unload
    // -----------------------------------------------------------------------

    pub async fn load(&self, id: &str) -> Result<PluginRecord, PluginError> {
        let (versions, pending) = {
            let mut table = self.shared.table.write().await;
            if table.contains_key(id) {
                return Err(PluginError::AlreadyLoaded(id.to_string()));
            }
            let entry = PluginEntry::reserve(id, self.shared.clock.now());
            let pending = entry.gate.clone().try_write_owned().map_err(|_| {
                PluginError::Other(anyhow::anyhow!("fresh gate for '{id}' already held"))
            })?;
            table.insert(id.to_string(), entry);
            let versions = table
                .values()
                .filter(|e| {
                    matches!(
                        e.record.status,
                        PluginStatus::Loaded | PluginStatus::Active | PluginStatus::Inactive
                    )
                })
                .map(|e| (e.record.id.clone(), e.record.descriptor.version.clone()))
                .collect::<HashMap<_, _>>();
            (versions, pending)
        };
        info!(plugin = %id, "Loading plugin");

        // Runs detached so a dropped caller cannot strand the reservation.
        let task = tokio::spawn(complete_load(
            self.shared.clone(),
            self.loader.clone(),
            self.options.auto_activate,
            id.to_string(),
            versions,
            pending,
        ));
        match task.await {
            Ok(result) => result,
            Err(e) => {
                error!(plugin = %id, error = %e, "Plugin load task panicked");
                self.shared.table.write().await.remove(id);
                let source = LoadError::InitializationFailed(format!("load task failed: {e}"));
                self.shared
                    .emit(id, PluginEventKind::LoadFailed, json!({"error": source.to_string()}));
                Err(PluginError::LoadFailed {
                    id: id.to_string(),
                    source,
                })
            }
        }
    }

    /// Remove a plugin. Cleanup failures are logged, never returned.
    pub async fn unload(&self, id: &str) -> Result<(), PluginError> {
        let (instance, gate) = {
            let mut table = self.shared.table.write().await;
            let entry = table
                .get_mut(id)
                .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
            lifecycle::transition(&mut entry.record, PluginStatus::Unloading)?;
            (entry.instance.clone(), entry.gate.clone())
        };
        info!(plugin = %id, "Unloading plugin");

        let task = tokio::spawn(complete_unload(
            self.shared.clone(),
            self.sandbox.clone(),
            self.options.unload_drain_timeout,
            id.to_string(),
            instance,
            gate,
        ));
        if let Err(e) = task.await {
            error!(plugin = %id, error = %e, "Plugin unload task panicked; removing entry");
            if let Some(sandbox) = &self.sandbox {
                sandbox.release(id);
            }
            self.shared.table.write().await.remove(id);
            self.shared.emit(id, PluginEventKind::Unloaded, serde_json::Value::Null);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Explicit transitions
    // -----------------------------------------------------------------------

    /// `Loaded → Active` or `Inactive → Active`.
    pub async fn activate(&self, id: &str) -> Result<PluginRecord, PluginError> {
        self.transition(id, PluginStatus::Active, None).await
    }

    /// `Active → Inactive`.
    pub async fn deactivate(&self, id: &str) -> Result<PluginRecord, PluginError> {
        self.transition(id, PluginStatus::Inactive, None).await
    }

    /// Move a `Loaded` or `Active` plugin to `Error`. It stays listed until unloaded.
    pub async fn mark_error(
        &self,
        id: &str,
        reason: impl Into<String>,
    ) -> Result<PluginRecord, PluginError> {
        self.transition(id, PluginStatus::Error, Some(reason.into()))
            .await
    }

    async fn transition(
        &self,
        id: &str,
        next: PluginStatus,
        reason: Option<String>,
    ) -> Result<PluginRecord, PluginError> {
        let record = {
            let mut table = self.shared.table.write().await;
            let entry = table
                .get_mut(id)
                .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
            // Reservations belong to the in-progress load.
            if entry.record.status == PluginStatus::Loading {
                return Err(PluginError::InvalidTransition {
                    id: id.to_string(),
                    from: PluginStatus::Loading,
                    to: next,
                });
            }
            lifecycle::transition(&mut entry.record, next)?;
            if next == PluginStatus::Error {
                entry.record.error = reason.clone();
            }
            entry.record.clone()
        };

        let kind = match next {
            PluginStatus::Active => PluginEventKind::Activated,
            PluginStatus::Inactive => PluginEventKind::Deactivated,
            _ => PluginEventKind::Failed,
        };
        info!(plugin = %id, status = %next, "Plugin status changed");
        self.shared.emit(id, kind, json!({"reason": reason}));
        Ok(record)
    }

    // -----------------------------------------------------------------------
    // Invocation
    // -----------------------------------------------------------------------

    pub async fn execute(
        &self,
        id: &str,
        capability: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, PluginError> {
        self.execute_with_cancel(id, capability, params, &CancellationToken::new())
            .await
    }

    /// Like `execute`; firing `cancel` fails the invocation with `Cancelled`.
    pub async fn execute_with_cancel(
        &self,
        id: &str,
        capability: &str,
        params: serde_json::Value,
        cancel: &CancellationToken,
    ) -> Result<serde_json::Value, PluginError> {
        let (contract, in_flight) = {
            let table = self.shared.table.read().await;
            let entry = table
                .get(id)
                .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
            let not_active = || PluginError::NotActive {
                id: id.to_string(),
                status: entry.record.status,
            };
            if entry.record.status != PluginStatus::Active {
                return Err(not_active());
            }
            if !entry.record.capabilities.iter().any(|c| c.name == capability) {
                return Err(PluginError::UnsupportedCapability {
                    plugin: id.to_string(),
                    capability: capability.to_string(),
                });
            }
            let contract = entry.instance.clone().ok_or_else(not_active)?;
            let in_flight = entry.gate.clone().try_read_owned().map_err(|_| not_active())?;
            (contract, in_flight)
        };

        let started = Instant::now();
        let result = match &self.sandbox {
            Some(sandbox) => {
                sandbox
                    .run(id, capability, cancel, move |ctx| async move {
                        contained(id, contract.execute(&ctx, capability, params)).await
                    })
                    .await
            }
            None => {
                let ctx = InvocationContext::new(
                    id,
                    capability,
                    cancel.child_token(),
                    Arc::new(Unrestricted),
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => Err(PluginError::Cancelled { plugin: id.to_string() }),
                    result = contained(id, contract.execute(&ctx, capability, params)) => result,
                }
            }
        };
        let elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        match &result {
            Ok(_) => {
                let now = self.shared.clock.now();
                if let Some(entry) = self.shared.table.write().await.get_mut(id) {
                    entry.record.usage.invocation_count += 1;
                    entry.record.usage.last_used = Some(now);
                }
                debug!(plugin = %id, capability = %capability, elapsed_ms, "Capability executed");
                self.shared.emit(
                    id,
                    PluginEventKind::Executed,
                    json!({"capability": capability, "elapsedMs": elapsed_ms}),
                );
            }
            Err(e) => {
                warn!(plugin = %id, capability = %capability, error = %e, sandbox = e.is_sandbox_violation(), "Capability failed");
                self.shared.emit(
                    id,
                    PluginEventKind::ExecutionFailed,
                    json!({"capability": capability, "error": e.to_string(), "elapsedMs": elapsed_ms}),
                );
            }
        }
        // Usage lands before an unload can drain the gate.
        drop(in_flight);
        result
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// Copies of every record, sorted by ID.
    pub async fn list(&self) -> Vec<PluginRecord> {
        let mut records: Vec<PluginRecord> = self
            .shared
            .table
            .read()
            .await
            .values()
            .map(|e| e.record.clone())
            .collect();
        records.sort_by(|a, b| a.id.cmp(&b.id));
        records
    }

    pub async fn inspect(&self, id: &str) -> Result<PluginRecord, PluginError> {
        self.shared
            .table
            .read()
            .await
            .get(id)
            .map(|e| e.record.clone())
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }
}

/// Run a contract call, turning a panic inside the plugin into `ExecutionFailed`.
async fn contained<Fut>(id: &str, call: Fut) -> Result<serde_json::Value, PluginError>
where
    Fut: std::future::Future<Output = Result<serde_json::Value, PluginError>>,
{
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(plugin = %id, panic = %message, "Plugin panicked during execute");
            Err(PluginError::ExecutionFailed {
                plugin: id.to_string(),
                message: format!("plugin panicked: {message}"),
            })
        }
    }
}

async fn complete_load(
    shared: Arc<Shared>,
    loader: Arc<PluginLoader>,
    auto_activate: bool,
    id: PluginId,
    versions: HashMap<PluginId, String>,
    _pending: OwnedRwLockWriteGuard<()>,
) -> Result<PluginRecord, PluginError> {
    let LoadedPlugin {
        descriptor,
        instance,
    } = match loader.load(&id, &versions).await {
        Ok(loaded) => loaded,
        Err(source) => {
            shared.table.write().await.remove(&id);
            warn!(plugin = %id, error = %source, "Plugin load failed");
            shared.emit(&id, PluginEventKind::LoadFailed, json!({"error": source.to_string()}));
            return Err(PluginError::LoadFailed { id, source });
        }
    };

    let version = descriptor.version.clone();
    let (record, activated) = {
        let mut table = shared.table.write().await;
        let entry = table.get_mut(&id).ok_or_else(|| {
            PluginError::Other(anyhow::anyhow!("load reservation for '{id}' disappeared"))
        })?;
        entry.record.capabilities = descriptor.capabilities.clone();
        entry.record.descriptor = descriptor;
        entry.record.has_health_probe = instance.probe.is_some();
        entry.record.loaded_at = shared.clock.now();
        entry.instance = Some(instance.contract);
        entry.probe = instance.probe;
        lifecycle::transition(&mut entry.record, PluginStatus::Loaded)?;
        let activated =
            auto_activate && lifecycle::transition(&mut entry.record, PluginStatus::Active).is_ok();
        (entry.record.clone(), activated)
    };

    info!(plugin = %id, version = %version, status = %record.status, "Plugin loaded");
    shared.emit(&id, PluginEventKind::Loaded, json!({"version": version}));
    if activated {
        shared.emit(&id, PluginEventKind::Activated, serde_json::Value::Null);
    }
    Ok(record)
}

async fn complete_unload(
    shared: Arc<Shared>,
    sandbox: Option<Arc<ResourceSandbox>>,
    drain_timeout: Duration,
    id: PluginId,
    instance: Option<Arc<dyn CapabilityPlugin>>,
    gate: Arc<RwLock<()>>,
) {
    let drained = time::timeout(drain_timeout, gate.write_owned()).await;
    if drained.is_err() {
        warn!(plugin = %id, timeout = ?drain_timeout, "In-flight invocations did not drain; cleaning up anyway");
    }

    if let Some(contract) = instance {
        if let Err(e) = contract.cleanup().await {
            let err = PluginError::UnloadCleanupFailed {
                id: id.clone(),
                message: format!("{e:#}"),
            };
            warn!(plugin = %id, error = %err, "Plugin cleanup failed");
            shared.emit(&id, PluginEventKind::CleanupFailed, json!({"error": err.to_string()}));
        }
    }

    if let Some(sandbox) = &sandbox {
        sandbox.release(&id);
    }
    shared.table.write().await.remove(&id);
    info!(plugin = %id, "Plugin unloaded");
    shared.emit(&id, PluginEventKind::Unloaded, serde_json::Value::Null);
}
