use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::PluginId;

/// A structured lifecycle event emitted by the plugin manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginEvent {
    pub id: Uuid,
    pub plugin_id: PluginId,
    pub timestamp: DateTime<Utc>,
    pub kind: PluginEventKind,
    pub payload: serde_json::Value,
}

/// Categories of plugin events.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PluginEventKind {
    /// Loader produced a running instance
    Loaded,
    /// Loader failed; no entry retained
    LoadFailed,
    /// Plugin became executable
    Activated,
    /// Plugin was paused
    Deactivated,
    /// Plugin moved to Error status
    Failed,
    /// Cleanup returned an error during unload
    CleanupFailed,
    /// Entry removed from the table
    Unloaded,
    /// A capability invocation succeeded
    Executed,
    /// A capability invocation failed
    ExecutionFailed,
    /// Health probe reported degraded
    HealthDegraded,
    /// Health probe reported unhealthy (or timed out)
    HealthUnhealthy,
}

impl PluginEvent {
    pub fn new(
        plugin_id: impl Into<PluginId>,
        kind: PluginEventKind,
        timestamp: DateTime<Utc>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            plugin_id: plugin_id.into(),
            timestamp,
            kind,
            payload,
        }
    }
}

impl std::fmt::Display for PluginEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(String::from))
            .unwrap_or_else(|| format!("{:?}", self));
        write!(f, "{}", s)
    }
}
