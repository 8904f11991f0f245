//! `warden-config`: plugin host configuration.
//!
//! Provides:
//! - Typed config schema (plugins, repositories, sandbox, health, host, logging)
//! - YAML loading with config-dir resolution
//! - `${ENV_VAR}` substitution
//! - Default value application
//! - Validation with dotted field paths
//! - RFC 7396 merge-patch for per-plugin settings

pub mod defaults;
pub mod env;
pub mod io;
pub mod schema;
pub mod validation;

pub use defaults::apply_all_defaults;
pub use env::{collect_referenced_vars, resolve_env_vars, resolve_env_vars_with, MissingEnvVarError};
pub use io::{config_dir, config_file_path, json_merge_patch, load_config, resolve_config_path};
pub use schema::{
    HealthConfig, HostConfig, LoggingConfig, PluginsConfig, RepositoryConfig, RepositoryKind,
    SandboxConfig, WardenConfig,
};
pub use validation::{validate, ConfigValidationError, ValidationReport};

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::path::Path;

/// Substitute env vars and apply defaults to a parsed config.
pub fn prepare(config: WardenConfig) -> Result<WardenConfig> {
    let value: Value =
        serde_json::to_value(&config).context("Failed to serialize config for processing")?;
    let value = resolve_env_vars(&value).context("Failed to resolve env vars in config")?;
    let config: WardenConfig =
        serde_json::from_value(value).context("Failed to deserialize config after processing")?;
    Ok(apply_all_defaults(config))
}

/// Load, substitute, default, and validate a config file.
///
/// This is the main entry point at runtime. Warnings are logged; any
/// validation error aborts.
pub async fn load_and_prepare(path: &Path) -> Result<WardenConfig> {
    let config = prepare(load_config(path).await?)?;

    let report = validate(&config);
    for warning in &report.warnings {
        tracing::warn!(path = %warning.path, message = %warning.message, "Config warning");
    }
    for error in &report.errors {
        tracing::error!(path = %error.path, message = %error.message, "Config error");
    }
    if !report.is_valid() {
        bail!(
            "Config at {} has {} validation error(s)",
            path.display(),
            report.errors.len()
        );
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_and_defaults_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "repositories:\n  - name: builtin\n    kind: inline\nhealth:\n  intervalSecs: 10\n",
        )
        .unwrap();
        let cfg = load_and_prepare(&path).await.unwrap();
        assert_eq!(cfg.repositories[0].enabled, Some(true));
        assert_eq!(cfg.health.unwrap().interval_secs, Some(10));
        assert_eq!(cfg.plugins.unwrap().auto_activate, Some(true));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "repositories:\n  - name: disk\n    kind: local\n").unwrap();
        let err = load_and_prepare(&path).await.unwrap_err();
        assert!(err.to_string().contains("validation error"));
    }
}
