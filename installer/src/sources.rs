//! Plugin source aggregation.
//!
//! Loads a root plugin source file together with everything it includes and
//! folds the entries into a single set keyed by package reference. Includes
//! are applied first, in declaration order, so a later include overrides an
//! earlier one and the declaring file overrides all of its includes.

use crate::plugin::{PluginSourceFile, PluginSpec};
use camino::{Utf8Path, Utf8PathBuf};
use log::debug;
use std::collections::BTreeMap;
use std::fs;
use thiserror::Error;

/// Override-resolved plugins keyed by package reference.
pub type PluginSet = BTreeMap<String, PluginSpec>;

/// Errors raised while loading plugin source files.
#[derive(Debug, Error)]
pub enum SourceError {
    /// A source file could not be read.
    #[error("failed to read plugin source {path}")]
    Read {
        /// The file that could not be read.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A source file is not a valid plugin source document.
    #[error("invalid plugin source {path}: {source}")]
    Parse {
        /// The offending file.
        path: Utf8PathBuf,
        /// The YAML error.
        #[source]
        source: serde_yaml::Error,
    },

    /// A plugin entry has an empty package reference.
    #[error("plugin source {path} declares a plugin with an empty package")]
    EmptyPackage {
        /// The offending file.
        path: Utf8PathBuf,
    },

    /// A file includes itself directly or through other includes.
    #[error("plugin source {path} is included recursively")]
    IncludeCycle {
        /// The file that was revisited.
        path: Utf8PathBuf,
    },
}

/// Load the plugin set rooted at `root`.
///
/// # Errors
///
/// Returns [`SourceError`] if any file in the include tree cannot be read
/// or parsed, declares an empty package, or forms an include cycle.
pub fn load_plugins(root: &Utf8Path) -> Result<PluginSet, SourceError> {
    let mut plugins = PluginSet::new();
    let mut chain = Vec::new();
    apply_source(root, &mut chain, &mut plugins)?;
    Ok(plugins)
}

/// Read and parse a single source file without following includes.
///
/// # Errors
///
/// Returns [`SourceError::Read`] or [`SourceError::Parse`].
pub fn read_source_file(path: &Utf8Path) -> Result<PluginSourceFile, SourceError> {
    let contents = fs::read_to_string(path).map_err(|source| SourceError::Read {
        path: path.to_owned(),
        source,
    })?;
    parse_source(path, &contents)
}

fn parse_source(path: &Utf8Path, contents: &str) -> Result<PluginSourceFile, SourceError> {
    // An empty document deserializes as null, which is a valid empty file.
    if contents.trim().is_empty() {
        return Ok(PluginSourceFile::default());
    }
    let file: PluginSourceFile =
        serde_yaml::from_str(contents).map_err(|source| SourceError::Parse {
            path: path.to_owned(),
            source,
        })?;
    if file.plugins.iter().any(|p| p.package.trim().is_empty()) {
        return Err(SourceError::EmptyPackage {
            path: path.to_owned(),
        });
    }
    Ok(file)
}

fn apply_source(
    path: &Utf8Path,
    chain: &mut Vec<Utf8PathBuf>,
    plugins: &mut PluginSet,
) -> Result<(), SourceError> {
    if chain.iter().any(|visited| visited.as_path() == path) {
        return Err(SourceError::IncludeCycle {
            path: path.to_owned(),
        });
    }

    let file = read_source_file(path)?;
    debug!(
        "loaded plugin source {path}: {} plugin(s), {} include(s)",
        file.plugins.len(),
        file.includes.len()
    );

    chain.push(path.to_owned());
    for include in &file.includes {
        apply_source(include, chain, plugins)?;
    }
    chain.pop();

    for plugin in file.plugins {
        plugins.insert(plugin.package.clone(), plugin);
    }
    Ok(())
}
