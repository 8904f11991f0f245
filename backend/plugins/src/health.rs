//! Health monitor
//!
//! Probes every resident plugin on a fixed interval. Probes within a cycle
//! run concurrently, each under its own deadline, so one stuck plugin cannot
//! delay the others. A panicking probe or cycle is logged and monitoring
//! continues.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use warden_config::HealthConfig;
use warden_core::{
    CapabilityPlugin, HealthProbe, HealthStatus, PluginEventKind, PluginHealth, PluginId,
    PluginStatus,
};

use crate::lifecycle::{self, health_from_status, is_resident};
use crate::manager::Shared;

#[derive(Debug, Clone)]
pub struct HealthOptions {
    pub enabled: bool,
    pub interval: Duration,
    pub probe_timeout: Duration,
    /// Consecutive unhealthy snapshots that move an Active or Loaded plugin to Error.
    pub unhealthy_threshold: Option<u32>,
}

impl Default for HealthOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(2),
            unhealthy_threshold: None,
        }
    }
}

impl HealthOptions {
    pub fn from_config(config: &HealthConfig) -> Self {
        Self {
            enabled: config.is_enabled(),
            interval: config.interval(),
            probe_timeout: config.probe_timeout(),
            unhealthy_threshold: config.unhealthy_threshold,
        }
    }
}

struct ProbeTarget {
    id: PluginId,
    status: PluginStatus,
    probe: Option<Arc<dyn HealthProbe>>,
    contract: Option<Arc<dyn CapabilityPlugin>>,
}

/// Background loop handle; dropped monitors keep running until `stop`.
pub(crate) struct HealthMonitor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl HealthMonitor {
    pub(crate) fn spawn(shared: Arc<Shared>, options: HealthOptions) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            info!(interval = ?options.interval, probe_timeout = ?options.probe_timeout, "Health monitor started");
            let mut interval = time::interval(options.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                }

                let mut cycle = tokio::spawn({
                    let shared = shared.clone();
                    let options = options.clone();
                    async move { run_cycle(&shared, &options).await }
                });
                tokio::select! {
                    _ = token.cancelled() => {
                        cycle.abort();
                        break;
                    }
                    joined = &mut cycle => match joined {
                        Ok(probed) => debug!(probed, "Health cycle complete"),
                        Err(e) if e.is_panic() => error!("Health cycle panicked; monitoring continues"),
                        Err(e) => warn!(error = %e, "Health cycle aborted"),
                    },
                }
            }
            info!("Health monitor stopped");
        });
        Self { cancel, handle }
    }

    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "Health monitor task ended abnormally");
        }
    }
}

/// Probe every resident plugin once and record the snapshots. Returns the number probed.
pub(crate) async fn run_cycle(shared: &Shared, options: &HealthOptions) -> usize {
    let targets: Vec<ProbeTarget> = {
        let table = shared.table.read().await;
        table
            .values()
            .filter(|e| is_resident(e.record.status))
            .map(|e| ProbeTarget {
                id: e.record.id.clone(),
                status: e.record.status,
                probe: e.probe.clone(),
                contract: e.instance.clone(),
            })
            .collect()
    };
    if targets.is_empty() {
        return 0;
    }

    let probe_timeout = options.probe_timeout;
    let (ids, tasks): (Vec<_>, Vec<_>) = targets
        .into_iter()
        .map(|target| {
            let id = target.id.clone();
            let now = shared.clock.now();
            (id, tokio::spawn(probe_one(target, probe_timeout, now)))
        })
        .unzip();
    let joined = join_all(tasks).await;

    let now = shared.clock.now();
    let mut events = Vec::new();
    {
        let mut table = shared.table.write().await;
        for (id, outcome) in ids.iter().zip(joined) {
            let mut health = outcome.unwrap_or_else(|e| {
                let message = if e.is_panic() {
                    "health probe panicked".to_string()
                } else {
                    format!("health probe aborted: {e}")
                };
                PluginHealth::new(HealthStatus::Unhealthy, message, now)
            });

            // Unloaded or unloading while the probe ran.
            let Some(entry) = table.get_mut(id) else { continue };
            if !is_resident(entry.record.status) {
                continue;
            }

            let previous = entry.record.health.as_ref();
            health.check_count = previous.map_or(0, |h| h.check_count) + 1;
            health.error_count = previous.map_or(0, |h| h.error_count)
                + u64::from(health.status == HealthStatus::Unhealthy);
            health.last_check = now;

            match health.status {
                HealthStatus::Unhealthy => {
                    entry.unhealthy_streak += 1;
                    warn!(plugin = %id, message = %health.message, streak = entry.unhealthy_streak, "Plugin unhealthy");
                    events.push((
                        id.clone(),
                        PluginEventKind::HealthUnhealthy,
                        json!({"message": health.message, "streak": entry.unhealthy_streak}),
                    ));
                }
                HealthStatus::Degraded => {
                    warn!(plugin = %id, message = %health.message, "Plugin degraded");
                    events.push((
                        id.clone(),
                        PluginEventKind::HealthDegraded,
                        json!({"message": health.message}),
                    ));
                }
                HealthStatus::Healthy => entry.unhealthy_streak = 0,
                HealthStatus::Unknown => {}
            }

            let breached = options
                .unhealthy_threshold
                .is_some_and(|n| entry.unhealthy_streak >= n);
            if breached
                && matches!(entry.record.status, PluginStatus::Active | PluginStatus::Loaded)
                && lifecycle::transition(&mut entry.record, PluginStatus::Error).is_ok()
            {
                let reason = format!(
                    "{} consecutive unhealthy health checks: {}",
                    entry.unhealthy_streak, health.message
                );
                error!(plugin = %id, reason = %reason, "Health policy moved plugin to error");
                entry.record.error = Some(reason.clone());
                events.push((id.clone(), PluginEventKind::Failed, json!({"reason": reason})));
            }

            entry.record.health = Some(health);
        }
    }

    for (id, kind, payload) in events {
        shared.emit(&id, kind, payload);
    }
    ids.len()
}

async fn probe_one(
    target: ProbeTarget,
    timeout: Duration,
    now: chrono::DateTime<chrono::Utc>,
) -> PluginHealth {
    match target.probe {
        Some(probe) => {
            let deadline = Instant::now() + timeout;
            match time::timeout(timeout, probe.check_health(deadline)).await {
                Ok(health) => health,
                Err(_) => PluginHealth::new(
                    HealthStatus::Unhealthy,
                    format!("health probe timed out after {timeout:?}"),
                    now,
                ),
            }
        }
        None => {
            let status = target
                .contract
                .map(|c| c.status())
                .unwrap_or(target.status);
            let (health, message) = health_from_status(status);
            PluginHealth::new(health, message, now)
        }
    }
}
