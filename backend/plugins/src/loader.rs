//! Plugin loader
//!
//! Turns a plugin ID into an initialized instance: resolves the descriptor,
//! verifies the package checksum and declared dependencies, instantiates the
//! registered factory for its entry point, and runs `initialize`. The loader
//! never touches the manager's table.

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use warden_config::{json_merge_patch, HostConfig};
use warden_core::{
    DependencyKind, DependencySpec, LoadError, PluginDescriptor, PluginId, PluginInstance,
};

use crate::registry::PluginRegistry;

/// Creates plugin instances for one entry point (e.g. `builtin:echo`).
pub trait PluginFactory: Send + Sync {
    fn create(&self, descriptor: &PluginDescriptor) -> Result<PluginInstance>;
}

impl<F> PluginFactory for F
where
    F: Fn(&PluginDescriptor) -> Result<PluginInstance> + Send + Sync,
{
    fn create(&self, descriptor: &PluginDescriptor) -> Result<PluginInstance> {
        self(descriptor)
    }
}

/// Output of a successful load, ready to be recorded by the manager.
pub struct LoadedPlugin {
    pub descriptor: PluginDescriptor,
    pub instance: PluginInstance,
}

pub struct PluginLoader {
    registry: Arc<PluginRegistry>,
    factories: HashMap<String, Arc<dyn PluginFactory>>,
    host: HostConfig,
    settings: HashMap<PluginId, serde_json::Value>,
}

impl PluginLoader {
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self {
            registry,
            factories: HashMap::new(),
            host: HostConfig::default(),
            settings: HashMap::new(),
        }
    }

    /// Libraries and services available to non-plugin dependencies.
    pub fn with_host(mut self, host: HostConfig) -> Self {
        self.host = host;
        self
    }

    /// Per-plugin settings merged over each descriptor's config.
    pub fn with_settings(mut self, settings: HashMap<PluginId, serde_json::Value>) -> Self {
        self.settings = settings;
        self
    }

    pub fn register_factory(&mut self, entry: impl Into<String>, factory: impl PluginFactory + 'static) {
        let entry = entry.into();
        debug!(entry = %entry, "Plugin factory registered");
        self.factories.insert(entry, Arc::new(factory));
    }

    pub fn registry(&self) -> &Arc<PluginRegistry> {
        &self.registry
    }

    /// Load `id`. `loaded` maps currently loaded plugin IDs to their versions.
    pub async fn load(
        &self,
        id: &str,
        loaded: &HashMap<PluginId, String>,
    ) -> Result<LoadedPlugin, LoadError> {
        let descriptor = self.registry.resolve(id).await?;
        self.verify_checksum(&descriptor).await?;
        self.check_dependencies(&descriptor, loaded)?;

        let factory = self
            .factories
            .get(&descriptor.entry)
            .ok_or_else(|| LoadError::NoFactory(descriptor.entry.clone()))?;
        let instance = factory
            .create(&descriptor)
            .map_err(|e| LoadError::InitializationFailed(format!("{e:#}")))?;

        let config = self.resolve_config(&descriptor);
        if let Err(e) = instance.contract.initialize(config).await {
            warn!(plugin = %id, error = %e, "Plugin initialization failed");
            if let Err(cleanup) = instance.contract.cleanup().await {
                warn!(plugin = %id, error = %cleanup, "Cleanup after failed initialization failed");
            }
            return Err(LoadError::InitializationFailed(format!("{e:#}")));
        }

        let declared: HashSet<&str> = descriptor
            .capabilities
            .iter()
            .map(|c| c.name.as_str())
            .collect();
        for reported in instance.contract.capabilities() {
            if !declared.contains(reported.name.as_str()) {
                warn!(plugin = %id, capability = %reported.name, "Plugin reports a capability its descriptor does not declare");
            }
        }

        info!(plugin = %id, version = %descriptor.version, entry = %descriptor.entry, "Plugin instantiated");
        Ok(LoadedPlugin {
            descriptor,
            instance,
        })
    }

    /// Descriptor config with the plugin's settings merge-patched over it.
    fn resolve_config(&self, descriptor: &PluginDescriptor) -> serde_json::Value {
        let mut config = descriptor.config.clone();
        if let Some(patch) = self.settings.get(&descriptor.id) {
            json_merge_patch(&mut config, patch);
        }
        if config.is_null() {
            config = serde_json::Value::Object(Default::default());
        }
        config
    }

    async fn verify_checksum(&self, descriptor: &PluginDescriptor) -> Result<(), LoadError> {
        let Some(expected) = &descriptor.checksum else {
            return Ok(());
        };
        let package = self
            .registry
            .package(&descriptor.id)
            .await
            .map_err(|e| LoadError::InitializationFailed(format!("fetch package: {e:#}")))?;
        let Some(bytes) = package else {
            return Err(LoadError::ChecksumMismatch {
                expected: expected.clone(),
                actual: "no package available".to_string(),
            });
        };
        let actual = sha256_hex(&bytes);
        if !actual.eq_ignore_ascii_case(expected) {
            return Err(LoadError::ChecksumMismatch {
                expected: expected.clone(),
                actual,
            });
        }
        debug!(plugin = %descriptor.id, "Checksum verified");
        Ok(())
    }

    fn check_dependencies(
        &self,
        descriptor: &PluginDescriptor,
        loaded: &HashMap<PluginId, String>,
    ) -> Result<(), LoadError> {
        for dep in &descriptor.dependencies {
            if let Err(reason) = self.check_dependency(dep, loaded) {
                if dep.required {
                    return Err(LoadError::DependencyUnsatisfied {
                        dependency: dep.name.clone(),
                        reason,
                    });
                }
                warn!(plugin = %descriptor.id, dependency = %dep.name, reason = %reason, "Optional dependency unsatisfied");
            }
        }
        Ok(())
    }

    fn check_dependency(
        &self,
        dep: &DependencySpec,
        loaded: &HashMap<PluginId, String>,
    ) -> Result<(), String> {
        let available = match dep.kind {
            DependencyKind::Plugin => loaded.get(&dep.name),
            DependencyKind::Library => self.host.libraries.get(&dep.name),
            DependencyKind::Service => self.host.services.get(&dep.name),
        };
        let Some(version) = available else {
            return Err(match dep.kind {
                DependencyKind::Plugin => "plugin is not loaded".to_string(),
                DependencyKind::Library => "library is not provided by the host".to_string(),
                DependencyKind::Service => "service is not provided by the host".to_string(),
            });
        };
        if let Some(min) = &dep.min_version {
            if compare_versions(version, min) == Ordering::Less {
                return Err(format!("version {version} is older than {min}"));
            }
        }
        if let Some(max) = &dep.max_version {
            if compare_versions(version, max) == Ordering::Greater {
                return Err(format!("version {version} is newer than {max}"));
            }
        }
        Ok(())
    }
}

/// Lowercase hex SHA-256.
pub fn sha256_hex(bytes: &[u8]) -> String {
    Sha256::digest(bytes)
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Compare dotted numeric versions; missing components count as zero and
/// non-numeric suffixes (`-beta`) are ignored.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.trim()
            .trim_start_matches('v')
            .split('.')
            .map(|part| {
                let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
                digits.parse().unwrap_or(0)
            })
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let ord = a.get(i).unwrap_or(&0).cmp(b.get(i).unwrap_or(&0));
        if ord != Ordering::Equal {
            return ord;
        }
    }
    Ordering::Equal
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::InlineRepository;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use warden_core::{
        CapabilityDescriptor, CapabilityPlugin, InvocationContext, PluginError, PluginStatus,
    };

    /// Records the config it was initialized with.
    #[derive(Default)]
    struct Recorder {
        config: Mutex<Option<serde_json::Value>>,
        fail_init: bool,
        cleaned: Mutex<bool>,
    }

    #[async_trait]
    impl CapabilityPlugin for Recorder {
        async fn initialize(&self, config: serde_json::Value) -> Result<()> {
            *self.config.lock().unwrap() = Some(config);
            if self.fail_init {
                anyhow::bail!("model weights missing");
            }
            Ok(())
        }
        async fn execute(
            &self,
            _ctx: &InvocationContext,
            _capability: &str,
            params: serde_json::Value,
        ) -> Result<serde_json::Value, PluginError> {
            Ok(params)
        }
        fn capabilities(&self) -> Vec<CapabilityDescriptor> {
            vec![CapabilityDescriptor::new("run"), CapabilityDescriptor::new("extra")]
        }
        fn status(&self) -> PluginStatus {
            PluginStatus::Active
        }
        async fn cleanup(&self) -> Result<()> {
            *self.cleaned.lock().unwrap() = true;
            Ok(())
        }
    }

    fn loader_with(repo: InlineRepository, plugin: Arc<Recorder>) -> PluginLoader {
        let mut registry = PluginRegistry::new();
        registry.add_repository(Arc::new(repo));
        let mut loader = PluginLoader::new(Arc::new(registry));
        loader.register_factory(
            "test:recorder",
            move |_: &PluginDescriptor| -> Result<PluginInstance> {
                Ok(PluginInstance::new(plugin.clone()))
            },
        );
        loader
    }

    fn base(id: &str) -> PluginDescriptor {
        PluginDescriptor::new(id, "test:recorder").with_capability(CapabilityDescriptor::new("run"))
    }

    #[test]
    fn version_ordering() {
        assert_eq!(compare_versions("1.2.0", "1.10.0"), Ordering::Less);
        assert_eq!(compare_versions("2.0", "2.0.0"), Ordering::Equal);
        assert_eq!(compare_versions("v3.1.4-beta", "3.1.4"), Ordering::Equal);
        assert_eq!(compare_versions("1.0.1", "1.0"), Ordering::Greater);
    }

    #[test]
    fn sha256_is_lowercase_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn merges_settings_over_descriptor_config() {
        let plugin = Arc::new(Recorder::default());
        let mut descriptor = base("llm");
        descriptor.config = serde_json::json!({"model": "small", "temperature": 0.2});
        let loader = loader_with(
            InlineRepository::new("builtin", 0).with_descriptor(descriptor),
            plugin.clone(),
        )
        .with_settings(HashMap::from([(
            "llm".to_string(),
            serde_json::json!({"model": "large", "temperature": null}),
        )]));

        loader.load("llm", &HashMap::new()).await.unwrap();
        assert_eq!(
            plugin.config.lock().unwrap().clone().unwrap(),
            serde_json::json!({"model": "large"})
        );
    }

    #[tokio::test]
    async fn checksum_mismatch_rejected() {
        let plugin = Arc::new(Recorder::default());
        let mut descriptor = base("ocr");
        descriptor.checksum = Some(sha256_hex(b"expected"));
        let loader = loader_with(
            InlineRepository::new("builtin", 0)
                .with_descriptor(descriptor)
                .with_package("ocr", b"tampered".to_vec()),
            plugin,
        );
        assert!(matches!(
            loader.load("ocr", &HashMap::new()).await,
            Err(LoadError::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn checksum_match_accepted() {
        let plugin = Arc::new(Recorder::default());
        let mut descriptor = base("ocr");
        descriptor.checksum = Some(sha256_hex(b"package").to_uppercase());
        let loader = loader_with(
            InlineRepository::new("builtin", 0)
                .with_descriptor(descriptor)
                .with_package("ocr", b"package".to_vec()),
            plugin,
        );
        assert!(loader.load("ocr", &HashMap::new()).await.is_ok());
    }

    #[tokio::test]
    async fn dependency_checks() {
        let plugin = Arc::new(Recorder::default());
        let descriptor = base("vision")
            .with_dependency(DependencySpec {
                name: "llm".to_string(),
                kind: DependencyKind::Plugin,
                required: true,
                min_version: Some("1.2".to_string()),
                max_version: None,
            })
            .with_dependency(DependencySpec {
                name: "cuda".to_string(),
                kind: DependencyKind::Library,
                required: false,
                min_version: None,
                max_version: None,
            });
        let loader = loader_with(
            InlineRepository::new("builtin", 0).with_descriptor(descriptor),
            plugin,
        );

        let err = loader.load("vision", &HashMap::new()).await.err().unwrap();
        assert!(matches!(err, LoadError::DependencyUnsatisfied { ref dependency, .. } if dependency == "llm"));

        let old = HashMap::from([("llm".to_string(), "1.1.9".to_string())]);
        assert!(loader.load("vision", &old).await.is_err());

        let ok = HashMap::from([("llm".to_string(), "1.2.0".to_string())]);
        assert!(loader.load("vision", &ok).await.is_ok());
    }

    #[tokio::test]
    async fn host_library_satisfies_dependency() {
        let plugin = Arc::new(Recorder::default());
        let descriptor = base("vision").with_dependency(DependencySpec {
            name: "onnxruntime".to_string(),
            kind: DependencyKind::Library,
            required: true,
            min_version: None,
            max_version: Some("1.20".to_string()),
        });
        let host = HostConfig {
            libraries: HashMap::from([("onnxruntime".to_string(), "1.17.0".to_string())]),
            ..Default::default()
        };
        let loader = loader_with(
            InlineRepository::new("builtin", 0).with_descriptor(descriptor),
            plugin,
        )
        .with_host(host);
        assert!(loader.load("vision", &HashMap::new()).await.is_ok());
    }

    #[tokio::test]
    async fn failed_initialize_runs_cleanup() {
        let plugin = Arc::new(Recorder {
            fail_init: true,
            ..Default::default()
        });
        let loader = loader_with(
            InlineRepository::new("builtin", 0).with_descriptor(base("tts")),
            plugin.clone(),
        );
        let err = loader.load("tts", &HashMap::new()).await.err().unwrap();
        assert!(matches!(err, LoadError::InitializationFailed(ref m) if m.contains("weights")));
        assert!(*plugin.cleaned.lock().unwrap());
    }

    #[tokio::test]
    async fn unknown_entry_has_no_factory() {
        let descriptor = PluginDescriptor::new("stt", "native:whisper");
        let loader = loader_with(
            InlineRepository::new("builtin", 0).with_descriptor(descriptor),
            Arc::new(Recorder::default()),
        );
        assert!(matches!(
            loader.load("stt", &HashMap::new()).await,
            Err(LoadError::NoFactory(entry)) if entry == "native:whisper"
        ));
    }
}
