//! Lifecycle transitions of a managed plugin.
//!
//! Edges: Loading → {Loaded, Error}; Loaded → {Active, Unloading, Error};
//! Active → {Inactive, Unloading, Error}; Inactive → {Active, Unloading};
//! Error → {Unloading}. `Unloading` ends with the entry being removed.

use tracing::debug;

use warden_core::{HealthStatus, PluginError, PluginRecord, PluginStatus};

/// Move `record` to `next`, or fail without touching it.
pub fn transition(record: &mut PluginRecord, next: PluginStatus) -> Result<PluginStatus, PluginError> {
    let from = record.status;
    if !from.can_transition_to(next) {
        return Err(PluginError::InvalidTransition {
            id: record.id.clone(),
            from,
            to: next,
        });
    }
    debug!(plugin = %record.id, from = %from, to = %next, "Plugin status transition");
    record.status = next;
    Ok(from)
}

/// Statuses whose plugins hold a live instance and are probed by the health monitor.
pub fn is_resident(status: PluginStatus) -> bool {
    matches!(
        status,
        PluginStatus::Loaded | PluginStatus::Active | PluginStatus::Inactive | PluginStatus::Error
    )
}

/// Health implied by a plugin's own status when it has no probe.
pub fn health_from_status(status: PluginStatus) -> (HealthStatus, &'static str) {
    match status {
        PluginStatus::Error => (HealthStatus::Unhealthy, "plugin reports error status"),
        PluginStatus::Active | PluginStatus::Loaded => (HealthStatus::Healthy, "ok"),
        _ => (HealthStatus::Unknown, "no health probe"),
    }
}
