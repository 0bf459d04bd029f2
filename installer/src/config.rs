//! Run settings assembled from the command line and the environment.

use crate::cli::Cli;
use crate::error::{InstallerError, Result};
use crate::extraction::DEFAULT_MAX_ENTRY_SIZE;
use crate::merge::GLOBAL_CONFIG_FILE_NAME;
use camino::Utf8PathBuf;
use std::num::NonZeroUsize;
use std::thread;
use std::time::Duration;

/// Environment variable capping the size of a single archive entry.
pub const MAX_ENTRY_SIZE_ENV: &str = "MAX_ENTRY_SIZE";

/// Everything an installation run needs to know.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallConfig {
    /// Directory receiving archives, plugin directories and the merged config.
    pub plugins_root: Utf8PathBuf,
    /// Root plugin source file.
    pub source_file: Utf8PathBuf,
    /// Skip integrity verification for registry packages.
    pub skip_integrity_check: bool,
    /// Largest permitted archive entry, in bytes.
    pub max_entry_size: u64,
    /// Worker pool size.
    pub jobs: NonZeroUsize,
    /// Time budget for each package fetch.
    pub fetch_timeout: Option<Duration>,
}

impl InstallConfig {
    /// Create a configuration with default limits for the given locations.
    #[must_use]
    pub fn new(plugins_root: Utf8PathBuf, source_file: Utf8PathBuf) -> Self {
        Self {
            plugins_root,
            source_file,
            skip_integrity_check: false,
            max_entry_size: DEFAULT_MAX_ENTRY_SIZE,
            jobs: default_jobs(),
            fetch_timeout: None,
        }
    }

    /// Build the configuration from parsed flags and `MAX_ENTRY_SIZE`.
    ///
    /// # Errors
    ///
    /// Returns [`InstallerError::InvalidSetting`] if `MAX_ENTRY_SIZE` is set
    /// but is not a positive integer, or if `--jobs` is zero.
    pub fn from_cli(cli: &Cli) -> Result<Self> {
        let max_entry_size = max_entry_size_from_env()?;
        let jobs = match cli.jobs {
            Some(n) => NonZeroUsize::new(n).ok_or_else(|| InstallerError::InvalidSetting {
                name: "--jobs",
                value: n.to_string(),
                reason: "must be at least 1".to_owned(),
            })?,
            None => default_jobs(),
        };

        Ok(Self {
            plugins_root: cli.dynamic_plugins_root.clone(),
            source_file: cli.dynamic_plugins_file.clone(),
            skip_integrity_check: cli.skip_integrity_check,
            max_entry_size,
            jobs,
            fetch_timeout: cli.fetch_timeout.map(Duration::from_secs),
        })
    }

    /// Return the path of the merged configuration document.
    #[must_use]
    pub fn global_config_path(&self) -> Utf8PathBuf {
        self.plugins_root.join(GLOBAL_CONFIG_FILE_NAME)
    }
}

/// Worker count used when `--jobs` is not given.
#[must_use]
pub fn default_jobs() -> NonZeroUsize {
    thread::available_parallelism().unwrap_or(NonZeroUsize::MIN)
}

/// Read `MAX_ENTRY_SIZE`, falling back to the default when unset.
///
/// # Errors
///
/// Returns [`InstallerError::InvalidSetting`] when the variable is present
/// but is not a positive integer.
pub fn max_entry_size_from_env() -> Result<u64> {
    match std::env::var(MAX_ENTRY_SIZE_ENV) {
        Ok(raw) => parse_max_entry_size(&raw),
        Err(std::env::VarError::NotPresent) => Ok(DEFAULT_MAX_ENTRY_SIZE),
        Err(std::env::VarError::NotUnicode(raw)) => Err(InstallerError::InvalidSetting {
            name: MAX_ENTRY_SIZE_ENV,
            value: raw.to_string_lossy().into_owned(),
            reason: "not valid Unicode".to_owned(),
        }),
    }
}

fn parse_max_entry_size(raw: &str) -> Result<u64> {
    let invalid = |reason: String| InstallerError::InvalidSetting {
        name: MAX_ENTRY_SIZE_ENV,
        value: raw.to_owned(),
        reason,
    };
    match raw.trim().parse::<u64>() {
        Ok(0) => Err(invalid("must be greater than zero".to_owned())),
        Ok(size) => Ok(size),
        Err(err) => Err(invalid(err.to_string())),
    }
}
