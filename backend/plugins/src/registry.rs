//! Plugin registry: catalogs descriptors from prioritized repositories.
use anyhow::{Context, Result};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use warden_config::WardenConfig;
use warden_core::{LoadError, PluginDescriptor, PluginError, PluginId};

use crate::repository::{self, PluginRepository};

#[derive(Clone)]
struct CacheEntry {
    descriptor: PluginDescriptor,
    repository: String,
    fetched_at: Instant,
}

/// A repository that failed during `sync`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryFailure {
    pub repository: String,
    pub message: String,
}

impl From<RepositoryFailure> for PluginError {
    fn from(failure: RepositoryFailure) -> Self {
        PluginError::Repository {
            repository: failure.repository,
            message: failure.message,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    /// Descriptors in the cache after the sync.
    pub descriptors: usize,
    pub failures: Vec<RepositoryFailure>,
}

#[derive(Default)]
pub struct PluginRegistry {
    /// Sorted by descending priority; ties keep registration order.
    repositories: Vec<Arc<dyn PluginRepository>>,
    cache: RwLock<HashMap<PluginId, CacheEntry>>,
    cache_ttl: Option<Duration>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Populate the repository list from configuration.
    pub fn initialize(config: &WardenConfig) -> Result<Self> {
        let mut registry = Self::new().with_cache_ttl(config.plugins().cache_ttl());
        for repo_config in &config.repositories {
            let repo = repository::from_config(repo_config)
                .with_context(|| format!("configure repository '{}'", repo_config.name))?;
            registry.add_repository(Arc::from(repo));
        }
        info!(
            repositories = registry.repositories.len(),
            "Plugin registry initialized"
        );
        Ok(registry)
    }

    /// Cached descriptors older than `ttl` are re-resolved.
    pub fn with_cache_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn add_repository(&mut self, repo: Arc<dyn PluginRepository>) {
        let pos = self
            .repositories
            .iter()
            .position(|r| r.priority() < repo.priority())
            .unwrap_or(self.repositories.len());
        self.repositories.insert(pos, repo);
    }

    /// Repository names in lookup order.
    pub fn repositories(&self) -> Vec<&str> {
        self.repositories.iter().map(|r| r.name()).collect()
    }

    fn is_fresh(&self, entry: &CacheEntry) -> bool {
        match self.cache_ttl {
            Some(ttl) => entry.fetched_at.elapsed() < ttl,
            None => true,
        }
    }

    fn enabled(&self) -> impl Iterator<Item = &Arc<dyn PluginRepository>> {
        self.repositories.iter().filter(|r| r.is_enabled())
    }

    /// Best-priority descriptor for `id`: cache first, then each repository in order.
    pub async fn resolve(&self, id: &str) -> Result<PluginDescriptor, LoadError> {
        if let Some(entry) = self.cache.read().await.get(id) {
            if self.is_fresh(entry) {
                return Ok(entry.descriptor.clone());
            }
        }

        for repo in self.enabled() {
            match repo.fetch_descriptor(id).await {
                Ok(Some(descriptor)) => {
                    if let Err(e) = descriptor.validate() {
                        warn!(repository = %repo.name(), plugin = %id, error = %e, "Ignoring invalid descriptor");
                        continue;
                    }
                    debug!(repository = %repo.name(), plugin = %id, "Descriptor resolved");
                    self.cache.write().await.insert(
                        id.to_string(),
                        CacheEntry {
                            descriptor: descriptor.clone(),
                            repository: repo.name().to_string(),
                            fetched_at: Instant::now(),
                        },
                    );
                    return Ok(descriptor);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(repository = %repo.name(), plugin = %id, error = %e, "Repository lookup failed");
                }
            }
        }

        Err(LoadError::DescriptorNotFound(id.to_string()))
    }

    /// Package bytes from the repository that supplied the cached descriptor.
    pub async fn package(&self, id: &str) -> Result<Option<Vec<u8>>> {
        let source = self
            .cache
            .read()
            .await
            .get(id)
            .map(|entry| entry.repository.clone());
        let Some(source) = source else {
            return Ok(None);
        };
        match self.repositories.iter().find(|r| r.name() == source) {
            Some(repo) => repo.fetch_package(id).await,
            None => Ok(None),
        }
    }

    /// Refresh the cache from every enabled repository.
    ///
    /// A failing repository is reported, not fatal; its previously cached
    /// descriptors are kept.
    pub async fn sync(&self) -> SyncReport {
        let mut fresh: HashMap<PluginId, CacheEntry> = HashMap::new();
        let mut failures = Vec::new();
        let now = Instant::now();

        for repo in self.enabled() {
            match repo.list_available().await {
                Ok(descriptors) => {
                    for descriptor in descriptors {
                        if let Err(e) = descriptor.validate() {
                            warn!(repository = %repo.name(), error = %e, "Ignoring invalid descriptor");
                            continue;
                        }
                        // Repositories are visited highest priority first.
                        fresh.entry(descriptor.id.clone()).or_insert(CacheEntry {
                            descriptor,
                            repository: repo.name().to_string(),
                            fetched_at: now,
                        });
                    }
                }
                Err(e) => {
                    warn!(repository = %repo.name(), error = %e, "Repository sync failed");
                    failures.push(RepositoryFailure {
                        repository: repo.name().to_string(),
                        message: format!("{e:#}"),
                    });
                }
            }
        }

        let failed: HashSet<&str> = failures.iter().map(|f| f.repository.as_str()).collect();
        let mut cache = self.cache.write().await;
        for (id, entry) in cache.drain() {
            if failed.contains(entry.repository.as_str()) {
                fresh.entry(id).or_insert(entry);
            }
        }
        *cache = fresh;

        info!(
            descriptors = cache.len(),
            failures = failures.len(),
            "Registry synced"
        );
        SyncReport {
            descriptors: cache.len(),
            failures,
        }
    }

    /// Cached descriptors, sorted by ID.
    pub async fn list_available(&self) -> Vec<PluginDescriptor> {
        let mut descriptors: Vec<_> = self
            .cache
            .read()
            .await
            .values()
            .map(|e| e.descriptor.clone())
            .collect();
        descriptors.sort_by(|a, b| a.id.cmp(&b.id));
        descriptors
    }

    /// Drop one cached descriptor so the next `resolve` refetches it.
    pub async fn invalidate(&self, id: &str) -> bool {
        self.cache.write().await.remove(id).is_some()
    }
}
