//! Wires configuration into a running plugin manager.

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use warden_config::WardenConfig;
use warden_plugins::{register_builtins, ManagerOptions, PluginLoader, PluginManager, PluginRegistry};
use warden_sandbox::{ApiAllowlist, ResourceSandbox};

pub fn build_registry(config: &WardenConfig) -> Result<Arc<PluginRegistry>> {
    Ok(Arc::new(PluginRegistry::initialize(config)?))
}

/// `None` when sandboxing is switched off.
pub fn build_sandbox(config: &WardenConfig) -> Option<ResourceSandbox> {
    let sandbox = config.sandbox();
    if !sandbox.is_enabled() {
        info!("Sandbox disabled; invocations run unrestricted");
        return None;
    }
    let allowlist = ApiAllowlist::from_patterns(sandbox.allowed_apis.iter().cloned());
    let mut built = ResourceSandbox::new(sandbox.limits(), allowlist);
    for (id, limits) in &sandbox.overrides {
        built = built.with_override(id.clone(), limits.clone());
    }
    Some(built)
}

pub fn build_manager(config: &WardenConfig) -> Result<PluginManager> {
    let registry = build_registry(config)?;
    let mut loader = PluginLoader::new(registry)
        .with_host(config.host())
        .with_settings(config.plugins().settings);
    register_builtins(&mut loader);

    let mut builder =
        PluginManager::builder(Arc::new(loader)).options(ManagerOptions::from_config(config));
    if let Some(sandbox) = build_sandbox(config) {
        builder = builder.sandbox(Arc::new(sandbox));
    }
    Ok(builder.build())
}
