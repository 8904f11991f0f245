//! Descriptor sources consulted by the registry.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::{debug, warn};

use warden_config::{RepositoryConfig, RepositoryKind};
use warden_core::{PluginDescriptor, PluginId};

use crate::manifest::PluginManifest;

/// A prioritized source of plugin descriptors.
#[async_trait]
pub trait PluginRepository: Send + Sync {
    fn name(&self) -> &str;

    /// Higher wins when two repositories supply the same ID.
    fn priority(&self) -> i32;

    fn is_enabled(&self) -> bool {
        true
    }

    /// `Ok(None)` when this repository does not know the ID.
    async fn fetch_descriptor(&self, id: &str) -> Result<Option<PluginDescriptor>>;

    async fn list_available(&self) -> Result<Vec<PluginDescriptor>>;

    /// Package bytes covered by the descriptor's checksum, if this repository has them.
    async fn fetch_package(&self, _id: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }
}

/// Build a repository from its configuration entry.
pub fn from_config(config: &RepositoryConfig) -> Result<Box<dyn PluginRepository>> {
    match config.kind {
        RepositoryKind::Local => {
            let path = config
                .path
                .clone()
                .with_context(|| format!("local repository '{}' has no path", config.name))?;
            Ok(Box::new(
                LocalRepository::new(&config.name, path, config.priority)
                    .enabled(config.is_enabled()),
            ))
        }
        RepositoryKind::Inline => {
            let mut repo =
                InlineRepository::new(&config.name, config.priority).enabled(config.is_enabled());
            for descriptor in &config.plugins {
                repo = repo.with_descriptor(descriptor.clone());
            }
            Ok(Box::new(repo))
        }
    }
}

// ---------------------------------------------------------------------------
// Local directory
// ---------------------------------------------------------------------------

/// Scans `<root>/<dir>/warden-plugin.json`.
pub struct LocalRepository {
    name: String,
    root: PathBuf,
    priority: i32,
    enabled: bool,
}

impl LocalRepository {
    pub fn new(name: impl Into<String>, root: impl Into<PathBuf>, priority: i32) -> Self {
        Self {
            name: name.into(),
            root: root.into(),
            priority,
            enabled: true,
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Every valid manifest under the root, with its directory.
    async fn scan(&self) -> Result<Vec<(PathBuf, PluginManifest)>> {
        if !tokio::fs::try_exists(&self.root).await.unwrap_or(false) {
            debug!(repository = %self.name, root = %self.root.display(), "Repository directory missing");
            return Ok(Vec::new());
        }

        let mut found = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .with_context(|| format!("read plugins dir {}", self.root.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let plugin_dir = entry.path();
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            match PluginManifest::read(&plugin_dir).await {
                Ok(manifest) => found.push((plugin_dir, manifest)),
                Err(e) => {
                    warn!(repository = %self.name, dir = ?entry.file_name(), error = %e, "Skipping invalid plugin manifest");
                }
            }
        }
        Ok(found)
    }

    async fn find(&self, id: &str) -> Result<Option<(PathBuf, PluginManifest)>> {
        Ok(self
            .scan()
            .await?
            .into_iter()
            .find(|(_, manifest)| manifest.descriptor.id == id))
    }
}

#[async_trait]
impl PluginRepository for LocalRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn fetch_descriptor(&self, id: &str) -> Result<Option<PluginDescriptor>> {
        Ok(self.find(id).await?.map(|(_, manifest)| manifest.descriptor))
    }

    async fn list_available(&self) -> Result<Vec<PluginDescriptor>> {
        Ok(self
            .scan()
            .await?
            .into_iter()
            .map(|(_, manifest)| manifest.descriptor)
            .collect())
    }

    async fn fetch_package(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let Some((dir, manifest)) = self.find(id).await? else {
            return Ok(None);
        };
        let Some(path) = manifest.package_path(&dir)? else {
            return Ok(None);
        };
        let bytes = tokio::fs::read(&path)
            .await
            .with_context(|| format!("read package {}", path.display()))?;
        Ok(Some(bytes))
    }
}

// ---------------------------------------------------------------------------
// Inline
// ---------------------------------------------------------------------------

/// Descriptors held in memory (from config, or registered in code).
pub struct InlineRepository {
    name: String,
    priority: i32,
    enabled: bool,
    descriptors: HashMap<PluginId, PluginDescriptor>,
    packages: HashMap<PluginId, Vec<u8>>,
}

impl InlineRepository {
    pub fn new(name: impl Into<String>, priority: i32) -> Self {
        Self {
            name: name.into(),
            priority,
            enabled: true,
            descriptors: HashMap::new(),
            packages: HashMap::new(),
        }
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_descriptor(mut self, descriptor: PluginDescriptor) -> Self {
        self.descriptors.insert(descriptor.id.clone(), descriptor);
        self
    }

    pub fn with_package(mut self, id: impl Into<PluginId>, bytes: impl Into<Vec<u8>>) -> Self {
        self.packages.insert(id.into(), bytes.into());
        self
    }
}

#[async_trait]
impl PluginRepository for InlineRepository {
    fn name(&self) -> &str {
        &self.name
    }

    fn priority(&self) -> i32 {
        self.priority
    }

    fn is_enabled(&self) -> bool {
        self.enabled
    }

    async fn fetch_descriptor(&self, id: &str) -> Result<Option<PluginDescriptor>> {
        Ok(self.descriptors.get(id).cloned())
    }

    async fn list_available(&self) -> Result<Vec<PluginDescriptor>> {
        Ok(self.descriptors.values().cloned().collect())
    }

    async fn fetch_package(&self, id: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.packages.get(id).cloned())
    }
}
