//! Plugin event logger
//!
//! Drains the plugin event bus and writes each event, redacted, under the
//! `plugin_events` tracing target.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warden_core::{PluginEvent, PluginEventKind};

use crate::redact::redact_value;

pub struct PluginEventLogger;

impl PluginEventLogger {
    /// Log one event with its payload scrubbed.
    pub fn log_event(event: &PluginEvent) {
        let payload = redact_value(&event.payload);
        match event.kind {
            PluginEventKind::LoadFailed
            | PluginEventKind::Failed
            | PluginEventKind::CleanupFailed
            | PluginEventKind::HealthUnhealthy => warn!(
                target: "plugin_events",
                event_id = %event.id,
                plugin = %event.plugin_id,
                kind = %event.kind,
                timestamp = %event.timestamp,
                payload = %payload,
                "Plugin event"
            ),
            _ => info!(
                target: "plugin_events",
                event_id = %event.id,
                plugin = %event.plugin_id,
                kind = %event.kind,
                timestamp = %event.timestamp,
                payload = %payload,
                "Plugin event"
            ),
        }
    }

    /// Spawn a task logging every event from `rx` until `cancel` fires or the bus closes.
    pub fn spawn(
        mut rx: broadcast::Receiver<PluginEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(event) => Self::log_event(&event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(target: "plugin_events", skipped, "Event logger lagged behind the bus");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
            debug!("Plugin event logger stopped");
        })
    }
}
