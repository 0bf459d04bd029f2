//! Plugin declarations as read from plugin source files.
//!
//! A source file is a YAML document with two top-level keys: `plugins`, a
//! list of [`PluginSpec`] entries, and `includes`, a list of further source
//! files whose entries are folded in before the declaring file's own.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use serde_yaml::Mapping;

/// Prefix marking a package reference as a path relative to the working
/// directory rather than a registry identifier.
pub const LOCAL_PACKAGE_PREFIX: &str = "./";

/// One plugin entry in a source file.
///
/// # Examples
///
/// ```
/// use dynamic_plugins_installer::plugin::PluginSpec;
///
/// let spec: PluginSpec = serde_yaml::from_str("package: ./plugins/foo").unwrap();
/// assert!(spec.is_local());
/// assert!(!spec.disabled);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginSpec {
    /// Package reference; also the identity key across all source files.
    pub package: String,
    /// Subresource-integrity style digest descriptor, `<algorithm>-<digest>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    /// When true the plugin is skipped entirely.
    #[serde(default)]
    pub disabled: bool,
    /// Configuration fragment merged into the global configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_config: Option<Mapping>,
}

impl PluginSpec {
    /// Create an enabled plugin with no integrity descriptor or config.
    #[must_use]
    pub fn new(package: impl Into<String>) -> Self {
        Self {
            package: package.into(),
            integrity: None,
            disabled: false,
            plugin_config: None,
        }
    }

    /// Return true when the package refers to a local path.
    #[must_use]
    pub fn is_local(&self) -> bool {
        self.package.starts_with(LOCAL_PACKAGE_PREFIX)
    }

    /// Return the local path portion of the reference, without the `./`
    /// marker, or `None` for registry packages.
    #[must_use]
    pub fn local_path(&self) -> Option<&str> {
        self.package.strip_prefix(LOCAL_PACKAGE_PREFIX)
    }
}

/// The parsed shape of one plugin source file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PluginSourceFile {
    /// Plugins declared directly in this file.
    #[serde(default)]
    pub plugins: Vec<PluginSpec>,
    /// Further source files applied before `plugins`.
    #[serde(default)]
    pub includes: Vec<Utf8PathBuf>,
}
