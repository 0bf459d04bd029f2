//! CLI argument definitions for the dynamic plugins installer.
//!
//! This module defines the command-line interface using clap. It is separated
//! from the main entrypoint to keep the binary small and focused on
//! orchestration.

use camino::Utf8PathBuf;
use clap::Parser;

/// Default directory that receives archives, extracted plugins and the
/// merged configuration.
pub const DEFAULT_PLUGINS_ROOT: &str = "./dynamic-plugins-root";

/// Default root plugin source file.
pub const DEFAULT_PLUGINS_FILE: &str = "./dynamic-plugins.default.yaml";

/// Install dynamic plugin packages and merge their configuration.
#[derive(Parser, Debug, Clone)]
#[command(name = "dynamic-plugins-installer")]
#[command(version, about)]
#[command(long_about = concat!(
    "Install dynamic plugin packages and merge their configuration.\n\n",
    "Reads a plugin source file (and everything it includes), packs each ",
    "enabled plugin with `npm pack`, verifies its integrity, extracts it into ",
    "the plugins root and merges every plugin's `pluginConfig` into a single ",
    "`app-config.dynamic-plugins.yaml`.\n\n",
    "The MAX_ENTRY_SIZE environment variable caps the size in bytes of any ",
    "single archive entry (default 20000000).",
))]
#[command(after_help = concat!(
    "EXAMPLES:\n",
    "  Install using the default locations:\n",
    "    $ dynamic-plugins-installer\n\n",
    "  Install into a custom root with four workers:\n",
    "    $ dynamic-plugins-installer --dynamic-plugins-root /opt/plugins -j 4\n\n",
    "  Trust registry packages without integrity descriptors:\n",
    "    $ dynamic-plugins-installer --skip-integrity-check",
))]
pub struct Cli {
    /// Directory receiving archives, plugin directories and the merged config.
    #[arg(long, value_name = "DIR", default_value = DEFAULT_PLUGINS_ROOT)]
    pub dynamic_plugins_root: Utf8PathBuf,

    /// Root plugin source file.
    #[arg(long, value_name = "FILE", default_value = DEFAULT_PLUGINS_FILE)]
    pub dynamic_plugins_file: Utf8PathBuf,

    /// Skip integrity verification for registry packages.
    #[arg(long)]
    pub skip_integrity_check: bool,

    /// Number of plugins processed in parallel [default: available CPUs].
    #[arg(short, long, value_name = "N")]
    pub jobs: Option<usize>,

    /// Kill `npm pack` after this many seconds.
    #[arg(long, value_name = "SECONDS")]
    pub fetch_timeout: Option<u64>,

    /// Increase log verbosity (repeatable: -v, -vv).
    #[arg(
        short,
        long = "verbose",
        alias = "verbosity",
        action = clap::ArgAction::Count,
        conflicts_with = "quiet"
    )]
    pub verbosity: u8,

    /// Only log warnings and errors.
    #[arg(short, long, conflicts_with = "verbosity")]
    pub quiet: bool,
}

impl Default for Cli {
    /// Creates a `Cli` with every flag at its command-line default.
    ///
    /// # Examples
    ///
    /// ```
    /// use dynamic_plugins_installer::cli::Cli;
    ///
    /// let cli = Cli::default();
    /// assert_eq!(cli.dynamic_plugins_root.as_str(), "./dynamic-plugins-root");
    /// assert!(!cli.skip_integrity_check);
    /// ```
    fn default() -> Self {
        Self {
            dynamic_plugins_root: Utf8PathBuf::from(DEFAULT_PLUGINS_ROOT),
            dynamic_plugins_file: Utf8PathBuf::from(DEFAULT_PLUGINS_FILE),
            skip_integrity_check: false,
            jobs: None,
            fetch_timeout: None,
            verbosity: 0,
            quiet: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_match_parsed_empty_command_line() {
        let parsed = Cli::parse_from(["dynamic-plugins-installer"]);
        let default = Cli::default();
        assert_eq!(parsed.dynamic_plugins_root, default.dynamic_plugins_root);
        assert_eq!(parsed.dynamic_plugins_file, default.dynamic_plugins_file);
        assert_eq!(parsed.jobs, None);
        assert_eq!(parsed.fetch_timeout, None);
        assert!(!parsed.skip_integrity_check);
    }

    #[test]
    fn parses_every_flag() {
        let cli = Cli::parse_from([
            "dynamic-plugins-installer",
            "--dynamic-plugins-root",
            "/opt/plugins",
            "--dynamic-plugins-file",
            "/etc/plugins.yaml",
            "--skip-integrity-check",
            "-j",
            "3",
            "--fetch-timeout",
            "90",
            "-vv",
        ]);
        assert_eq!(cli.dynamic_plugins_root, Utf8PathBuf::from("/opt/plugins"));
        assert_eq!(cli.dynamic_plugins_file, Utf8PathBuf::from("/etc/plugins.yaml"));
        assert!(cli.skip_integrity_check);
        assert_eq!(cli.jobs, Some(3));
        assert_eq!(cli.fetch_timeout, Some(90));
        assert_eq!(cli.verbosity, 2);
    }

    #[rstest]
    #[case::verbose_then_quiet(&["dynamic-plugins-installer", "-v", "-q"])]
    #[case::non_numeric_jobs(&["dynamic-plugins-installer", "--jobs", "many"])]
    #[case::unknown_flag(&["dynamic-plugins-installer", "--dry-run"])]
    fn rejects_invalid_command_lines(#[case] args: &[&str]) {
        assert!(Cli::try_parse_from(args).is_err());
    }
}
