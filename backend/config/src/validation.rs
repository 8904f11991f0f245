//! Config validation: deep checks with dotted field paths.

use crate::schema::{RepositoryKind, WardenConfig};
use std::collections::HashSet;
use thiserror::Error;

/// A config validation error with field path and message.
#[derive(Debug, Error)]
#[error("Config validation error at '{path}': {message}")]
pub struct ConfigValidationError {
    pub path: String,
    pub message: String,
}

/// A collection of validation errors found in one pass.
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }

    fn warn(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            path: path.into(),
            message: message.into(),
        });
    }
}

/// Validate the config and return a report of all errors and warnings.
pub fn validate(config: &WardenConfig) -> ValidationReport {
    let mut report = ValidationReport::default();
    validate_plugins(config, &mut report);
    validate_repositories(config, &mut report);
    validate_sandbox(config, &mut report);
    validate_health(config, &mut report);
    report
}

fn validate_plugins(config: &WardenConfig, report: &mut ValidationReport) {
    let Some(plugins) = &config.plugins else { return };
    let mut seen = HashSet::new();
    for id in &plugins.autoload {
        if !seen.insert(id.as_str()) {
            report.warn("plugins.autoload", format!("Plugin '{id}' is listed more than once"));
        }
    }
}

fn validate_repositories(config: &WardenConfig, report: &mut ValidationReport) {
    let mut names = HashSet::new();
    for (i, repo) in config.repositories.iter().enumerate() {
        let path = format!("repositories[{i}]");
        if repo.name.trim().is_empty() {
            report.error(format!("{path}.name"), "Repository name cannot be empty");
        } else if !names.insert(repo.name.as_str()) {
            report.error(
                format!("{path}.name"),
                format!("Duplicate repository name '{}'", repo.name),
            );
        }
        if repo.kind == RepositoryKind::Local && repo.path.is_none() {
            report.error(format!("{path}.path"), "A local repository requires a path");
        }
    }
}

fn validate_sandbox(config: &WardenConfig, report: &mut ValidationReport) {
    let Some(sandbox) = &config.sandbox else { return };
    if let Some(limits) = &sandbox.limits {
        for field in limits.disabled_fields() {
            report.warn(
                format!("sandbox.limits.{field}"),
                "Limit is 0: the resource is disabled and every invocation using it is rejected",
            );
        }
    }
    for (id, limits) in &sandbox.overrides {
        for field in limits.disabled_fields() {
            report.warn(
                format!("sandbox.overrides.{id}.{field}"),
                "Limit is 0: the resource is disabled for this plugin",
            );
        }
    }
}

fn validate_health(config: &WardenConfig, report: &mut ValidationReport) {
    let Some(health) = &config.health else { return };
    if health.interval_secs == Some(0) {
        report.error("health.intervalSecs", "intervalSecs must be >= 1");
    }
    if health.probe_timeout_ms == Some(0) {
        report.error("health.probeTimeoutMs", "probeTimeoutMs must be >= 1");
    }
    if health.unhealthy_threshold == Some(0) {
        report.error(
            "health.unhealthyThreshold",
            "unhealthyThreshold must be >= 1; omit it to disable the policy",
        );
    }
}
