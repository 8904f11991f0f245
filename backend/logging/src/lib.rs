//! Structured logging for the Warden plugin host.
//!
//! Handles subscriber setup with file rotation, plugin event logging, and redaction.

pub mod event_logger;
pub mod logger;
pub mod redact;

pub use event_logger::PluginEventLogger;
pub use logger::init_logger;
pub use redact::{redact_sensitive_data, redact_value};
