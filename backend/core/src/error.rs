use std::time::Duration;

use thiserror::Error;

use crate::types::{PluginId, PluginStatus, ResourceKind};

/// Caller-facing error type for every plugin host operation.
#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin not found: {0}")]
    NotFound(PluginId),

    #[error("plugin already loaded: {0}")]
    AlreadyLoaded(PluginId),

    #[error("plugin '{id}' is not active (status: {status})")]
    NotActive { id: PluginId, status: PluginStatus },

    #[error("failed to load plugin '{id}': {source}")]
    LoadFailed {
        id: PluginId,
        #[source]
        source: LoadError,
    },

    #[error("plugin '{plugin}' does not support capability '{capability}'")]
    UnsupportedCapability { plugin: PluginId, capability: String },

    #[error("plugin '{plugin}' reached its concurrency limit ({limit})")]
    ConcurrencyLimitExceeded { plugin: PluginId, limit: u64 },

    #[error("plugin '{plugin}' exceeded execution time of {timeout:?}")]
    ExecutionTimeout { plugin: PluginId, timeout: Duration },

    #[error("plugin '{plugin}' is not allowed to call API '{api}'")]
    ApiForbidden { plugin: PluginId, api: String },

    #[error("plugin '{plugin}' exceeded {resource} limit (used {used}, limit {limit})")]
    ResourceLimitExceeded {
        plugin: PluginId,
        resource: ResourceKind,
        used: u64,
        limit: u64,
    },

    #[error("cleanup of plugin '{id}' failed: {message}")]
    UnloadCleanupFailed { id: PluginId, message: String },

    #[error("plugin '{id}' cannot move from {from} to {to}")]
    InvalidTransition {
        id: PluginId,
        from: PluginStatus,
        to: PluginStatus,
    },

    #[error("invocation of plugin '{plugin}' was cancelled")]
    Cancelled { plugin: PluginId },

    #[error("plugin '{plugin}' failed: {message}")]
    ExecutionFailed { plugin: PluginId, message: String },

    #[error("repository '{repository}' error: {message}")]
    Repository { repository: String, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PluginError {
    /// True for violations detected by the sandbox rather than by the plugin.
    pub fn is_sandbox_violation(&self) -> bool {
        matches!(
            self,
            PluginError::ConcurrencyLimitExceeded { .. }
                | PluginError::ExecutionTimeout { .. }
                | PluginError::ApiForbidden { .. }
                | PluginError::ResourceLimitExceeded { .. }
        )
    }
}

/// Loader-internal causes, wrapped by [`PluginError::LoadFailed`].
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("no repository supplies a descriptor for '{0}'")]
    DescriptorNotFound(PluginId),

    #[error("dependency '{dependency}' unsatisfied: {reason}")]
    DependencyUnsatisfied { dependency: String, reason: String },

    #[error("initialization failed: {0}")]
    InitializationFailed(String),

    #[error("checksum mismatch (expected {expected}, got {actual})")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("no plugin factory registered for entry '{0}'")]
    NoFactory(String),
}
