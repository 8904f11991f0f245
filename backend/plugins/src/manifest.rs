//! Plugin manifest: the `warden-plugin.json` file at the root of a plugin package.
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use warden_core::PluginDescriptor;

/// File name looked up inside every plugin directory of a local repository.
pub const MANIFEST_FILE_NAME: &str = "warden-plugin.json";

/// Descriptor fields plus packaging information.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginManifest {
    #[serde(flatten)]
    pub descriptor: PluginDescriptor,
    /// Package file, relative to the plugin directory; its bytes are what `checksum` covers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
}

impl PluginManifest {
    /// Read and validate the manifest inside `plugin_dir`.
    pub async fn read(plugin_dir: &Path) -> Result<Self> {
        let manifest_path = plugin_dir.join(MANIFEST_FILE_NAME);
        let raw = tokio::fs::read_to_string(&manifest_path)
            .await
            .with_context(|| format!("read manifest at {}", manifest_path.display()))?;
        let manifest: PluginManifest =
            serde_json::from_str(&raw).context("parse plugin manifest")?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Validate the manifest for required fields.
    pub fn validate(&self) -> Result<()> {
        self.descriptor.validate()?;
        if let Some(main) = &self.main {
            if main.trim().is_empty() {
                bail!("Plugin manifest '{}' has an empty 'main'", self.descriptor.id);
            }
            package_path(Path::new("."), main)?;
        }
        Ok(())
    }

    /// Absolute location of the package file, if the manifest names one.
    pub fn package_path(&self, plugin_dir: &Path) -> Result<Option<PathBuf>> {
        self.main
            .as_deref()
            .map(|main| package_path(plugin_dir, main))
            .transpose()
    }
}

/// Join `main` onto `plugin_dir`, refusing paths that escape the directory.
fn package_path(plugin_dir: &Path, main: &str) -> Result<PathBuf> {
    let relative = Path::new(main);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes {
        bail!("Package path '{main}' must stay inside the plugin directory");
    }
    Ok(plugin_dir.join(relative))
}
