//! Event bus
//!
//! Publish-subscribe fan-out of plugin lifecycle events to loggers and other observers.

use tokio::sync::broadcast;
use tracing::debug;

use warden_core::PluginEvent;

/// Events buffered per subscriber before the slowest one starts lagging.
const EVENT_BUS_CAPACITY: usize = 256;

pub struct EventBus {
    sender: broadcast::Sender<PluginEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { sender: tx }
    }

    /// Deliver an event to every current subscriber; dropped when nobody listens.
    pub fn publish(&self, event: PluginEvent) {
        debug!(plugin = %event.plugin_id, kind = %event.kind, "Publishing plugin event");
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PluginEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
