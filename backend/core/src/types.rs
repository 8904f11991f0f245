use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique plugin identifier (e.g., "ocr-tesseract").
pub type PluginId = String;

/// Lifecycle status of a managed plugin.
///
/// `Unloaded` is implicit: a plugin without a table entry is unloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginStatus {
    Loading,
    Loaded,
    Active,
    Inactive,
    Unloading,
    Error,
}

impl PluginStatus {
    /// Whether the lifecycle table permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: PluginStatus) -> bool {
        use PluginStatus::*;
        matches!(
            (self, next),
            (Loading, Loaded)
                | (Loading, Error)
                | (Loaded, Active)
                | (Loaded, Unloading)
                | (Loaded, Error)
                | (Active, Inactive)
                | (Active, Unloading)
                | (Active, Error)
                | (Inactive, Active)
                | (Inactive, Unloading)
                | (Error, Unloading)
        )
    }
}

impl fmt::Display for PluginStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PluginStatus::Loading => "loading",
            PluginStatus::Loaded => "loaded",
            PluginStatus::Active => "active",
            PluginStatus::Inactive => "inactive",
            PluginStatus::Unloading => "unloading",
            PluginStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// A named operation a plugin declares it can perform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityDescriptor {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// JSON Schema for the capability's parameters.
    #[serde(default)]
    pub parameters: serde_json::Value,
    /// JSON Schema for the capability's result.
    #[serde(default)]
    pub returns: serde_json::Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub examples: Vec<serde_json::Value>,
}

impl CapabilityDescriptor {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            parameters: serde_json::Value::Null,
            returns: serde_json::Value::Null,
            examples: Vec::new(),
        }
    }
}

/// What a declared dependency refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyKind {
    Plugin,
    Library,
    Service,
}

/// A dependency declared by a plugin descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencySpec {
    pub name: String,
    pub kind: DependencyKind,
    #[serde(default = "default_required")]
    pub required: bool,
    /// Inclusive lower version bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,
    /// Inclusive upper version bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_version: Option<String>,
}

fn default_required() -> bool {
    true
}

/// Discovery-time record describing a plugin before it is loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginDescriptor {
    pub id: PluginId,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Key of the plugin factory that instantiates this plugin (e.g., "builtin:echo").
    #[serde(default)]
    pub entry: String,
    #[serde(default)]
    pub capabilities: Vec<CapabilityDescriptor>,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    /// Configuration handed to `initialize`.
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f32>,
    /// Lowercase hex SHA-256 of the package content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

fn default_version() -> String {
    "0.0.0".to_string()
}

impl PluginDescriptor {
    pub fn new(id: impl Into<PluginId>, entry: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: default_version(),
            description: String::new(),
            entry: entry.into(),
            capabilities: Vec::new(),
            dependencies: Vec::new(),
            config: serde_json::Value::Null,
            author: None,
            license: None,
            rating: None,
            checksum: None,
        }
    }

    pub fn with_capability(mut self, capability: CapabilityDescriptor) -> Self {
        self.capabilities.push(capability);
        self
    }

    pub fn with_dependency(mut self, dependency: DependencySpec) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn declares(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c.name == capability)
    }

    /// Validate required fields.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.id.trim().is_empty() {
            anyhow::bail!("Plugin descriptor missing 'id'");
        }
        let mut seen = std::collections::HashSet::new();
        for capability in &self.capabilities {
            if capability.name.trim().is_empty() {
                anyhow::bail!("Plugin '{}' declares a capability without a name", self.id);
            }
            if !seen.insert(capability.name.as_str()) {
                anyhow::bail!(
                    "Plugin '{}' declares capability '{}' twice",
                    self.id,
                    capability.name
                );
            }
        }
        Ok(())
    }
}

/// Self-reported health state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

/// Point-in-time health snapshot of a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginHealth {
    pub status: HealthStatus,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub metrics: HashMap<String, f64>,
    pub last_check: DateTime<Utc>,
    #[serde(default)]
    pub check_count: u64,
    #[serde(default)]
    pub error_count: u64,
}

impl PluginHealth {
    pub fn new(status: HealthStatus, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            status,
            message: message.into(),
            metrics: HashMap::new(),
            last_check: at,
            check_count: 0,
            error_count: 0,
        }
    }

    pub fn healthy(at: DateTime<Utc>) -> Self {
        Self::new(HealthStatus::Healthy, "ok", at)
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }
}

/// Usage counters, updated only after a successful execution.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageStats {
    pub invocation_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<DateTime<Utc>>,
}

/// Snapshot of a managed plugin, handed out by `list` and `inspect`.
///
/// This is always a copy; mutating it has no effect on the manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginRecord {
    pub id: PluginId,
    pub descriptor: PluginDescriptor,
    pub status: PluginStatus,
    pub capabilities: Vec<CapabilityDescriptor>,
    pub usage: UsageStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub health: Option<PluginHealth>,
    pub has_health_probe: bool,
    pub loaded_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A resource accounted by the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Memory,
    Cpu,
    Disk,
    Network,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceKind::Memory => "memory",
            ResourceKind::Cpu => "cpu",
            ResourceKind::Disk => "disk",
            ResourceKind::Network => "network",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_edges() {
        use PluginStatus::*;
        assert!(Loading.can_transition_to(Loaded));
        assert!(Active.can_transition_to(Inactive));
        assert!(Inactive.can_transition_to(Active));
        assert!(Error.can_transition_to(Unloading));
        assert!(!Error.can_transition_to(Active));
        assert!(!Inactive.can_transition_to(Error));
        assert!(!Loading.can_transition_to(Unloading));
        assert!(!Unloading.can_transition_to(Active));
    }

    #[test]
    fn descriptor_from_json_applies_defaults() {
        let raw = serde_json::json!({
            "id": "echo",
            "entry": "builtin:echo",
            "capabilities": [{ "name": "echo" }],
            "dependencies": [{ "name": "tokenizer", "kind": "library" }]
        });
        let descriptor: PluginDescriptor = serde_json::from_value(raw).unwrap();
        assert_eq!(descriptor.version, "0.0.0");
        assert!(descriptor.declares("echo"));
        assert!(descriptor.dependencies[0].required);
        descriptor.validate().unwrap();
    }

    #[test]
    fn duplicate_capability_is_invalid() {
        let descriptor = PluginDescriptor::new("dup", "builtin:echo")
            .with_capability(CapabilityDescriptor::new("echo"))
            .with_capability(CapabilityDescriptor::new("echo"));
        assert!(descriptor.validate().is_err());
    }

    #[test]
    fn status_display_matches_serde() {
        let json = serde_json::to_value(PluginStatus::Unloading).unwrap();
        assert_eq!(json.as_str().unwrap(), PluginStatus::Unloading.to_string());
    }
}
