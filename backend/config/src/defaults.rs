//! Config defaults: fills unset fields of a parsed config.

use crate::schema::{HealthConfig, LoggingConfig, PluginsConfig, SandboxConfig, WardenConfig};

/// Grace period for in-flight calls before cleanup runs on unload.
pub const DEFAULT_UNLOAD_DRAIN_TIMEOUT_MS: u64 = 5_000;

/// Seconds between health cycles.
pub const DEFAULT_HEALTH_INTERVAL_SECS: u64 = 30;

/// Per-probe deadline.
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 2_000;

pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Apply all defaults to a freshly loaded config.
pub fn apply_all_defaults(config: WardenConfig) -> WardenConfig {
    let config = apply_plugin_defaults(config);
    let config = apply_sandbox_defaults(config);
    let config = apply_health_defaults(config);
    apply_logging_defaults(config)
}

fn apply_plugin_defaults(mut config: WardenConfig) -> WardenConfig {
    let plugins = config.plugins.get_or_insert_with(PluginsConfig::default);
    if plugins.auto_activate.is_none() {
        plugins.auto_activate = Some(true);
    }
    if plugins.unload_drain_timeout_ms.is_none() {
        plugins.unload_drain_timeout_ms = Some(DEFAULT_UNLOAD_DRAIN_TIMEOUT_MS);
    }
    for repo in &mut config.repositories {
        if repo.enabled.is_none() {
            repo.enabled = Some(true);
        }
    }
    config
}

fn apply_sandbox_defaults(mut config: WardenConfig) -> WardenConfig {
    let sandbox = config.sandbox.get_or_insert_with(SandboxConfig::default);
    if sandbox.enabled.is_none() {
        sandbox.enabled = Some(true);
    }
    if sandbox.limits.is_none() {
        sandbox.limits = Some(Default::default());
    }
    config
}

fn apply_health_defaults(mut config: WardenConfig) -> WardenConfig {
    let health = config.health.get_or_insert_with(HealthConfig::default);
    if health.enabled.is_none() {
        health.enabled = Some(true);
    }
    if health.interval_secs.is_none() {
        health.interval_secs = Some(DEFAULT_HEALTH_INTERVAL_SECS);
    }
    if health.probe_timeout_ms.is_none() {
        health.probe_timeout_ms = Some(DEFAULT_PROBE_TIMEOUT_MS);
    }
    config
}

fn apply_logging_defaults(mut config: WardenConfig) -> WardenConfig {
    let logging = config.logging.get_or_insert_with(LoggingConfig::default);
    if logging.level.is_none() {
        logging.level = Some(DEFAULT_LOG_LEVEL.to_string());
    }
    if logging.json.is_none() {
        logging.json = Some(false);
    }
    config
}
