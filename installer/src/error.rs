//! Error types for the dynamic plugins installer.
//!
//! Component errors ([`SourceError`], [`FetchError`], [`IntegrityError`],
//! [`ExtractionError`]) are wrapped here so the orchestrator can decide
//! which failures stay local to one plugin and which halt the whole run.
//! Integrity and containment failures are always fatal: they suggest a
//! tampered or hostile artefact.

use crate::extraction::ExtractionError;
use crate::fetcher::FetchError;
use crate::integrity::IntegrityError;
use crate::sources::SourceError;
use camino::Utf8PathBuf;
use thiserror::Error;

/// Errors raised while processing a single plugin.
#[derive(Debug, Error)]
pub enum PluginError {
    /// The package could not be fetched.
    #[error(transparent)]
    Fetch(#[from] FetchError),

    /// The archive failed integrity verification.
    #[error(transparent)]
    Integrity(#[from] IntegrityError),

    /// The archive could not be extracted.
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

impl PluginError {
    /// Return true when this failure must abort the whole installation.
    ///
    /// # Examples
    ///
    /// ```
    /// use dynamic_plugins_installer::error::PluginError;
    /// use dynamic_plugins_installer::extraction::ExtractionError;
    ///
    /// let escape = PluginError::from(ExtractionError::PathEscape {
    ///     entry: "../escape".to_owned(),
    /// });
    /// assert!(escape.is_fatal());
    /// ```
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Fetch(_) => false,
            Self::Integrity(err) => err.is_security_violation(),
            Self::Extraction(err) => err.is_security_violation(),
        }
    }
}

/// Errors that can occur during an installation run.
#[derive(Debug, Error)]
pub enum InstallerError {
    /// The plugin source files could not be loaded.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// A plugin failed to install.
    #[error("plugin {package}: {source}")]
    Plugin {
        /// The package reference of the failing plugin.
        package: String,
        /// What went wrong.
        #[source]
        source: PluginError,
    },

    /// A run setting has an unusable value.
    #[error("invalid {name} value {value:?}: {reason}")]
    InvalidSetting {
        /// The setting name, such as an environment variable.
        name: &'static str,
        /// The rejected value.
        value: String,
        /// Why the value was rejected.
        reason: String,
    },

    /// The merged configuration could not be written.
    #[error("failed to write the merged plugins config file {path}")]
    ConfigWrite {
        /// The destination file.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A worker thread panicked while processing plugins.
    #[error("{count} plugin worker(s) panicked")]
    WorkerPanicked {
        /// How many workers panicked.
        count: usize,
    },

    /// An I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl InstallerError {
    /// Wrap a plugin failure with the plugin's identity.
    #[must_use]
    pub fn plugin(package: impl Into<String>, source: PluginError) -> Self {
        Self::Plugin {
            package: package.into(),
            source,
        }
    }

    /// Return true when the error must abort the run.
    ///
    /// Everything except a non-fatal plugin failure is fatal.
    #[must_use]
    pub const fn is_fatal(&self) -> bool {
        match self {
            Self::Plugin { source, .. } => source.is_fatal(),
            _ => true,
        }
    }
}

/// Result type alias using [`InstallerError`].
pub type Result<T> = std::result::Result<T, InstallerError>;
