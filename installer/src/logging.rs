//! Logging bootstrap for the installer binary.
//!
//! The library only emits records through the `log` facade. The binary
//! installs a `flexi_logger` backend that writes to stderr so progress lines
//! never mix with anything a caller might parse from stdout.

use flexi_logger::{FlexiLoggerError, Logger, LoggerHandle};

/// Map the `-v`/`-q` flags to a level specification.
///
/// # Examples
///
/// ```
/// use dynamic_plugins_installer::logging::level_for;
///
/// assert_eq!(level_for(0, false), "info");
/// assert_eq!(level_for(0, true), "warn");
/// assert_eq!(level_for(1, false), "debug");
/// ```
#[must_use]
pub const fn level_for(verbosity: u8, quiet: bool) -> &'static str {
    if quiet {
        return "warn";
    }
    match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

/// Start the stderr logger. `RUST_LOG`, when set, overrides the flags.
///
/// The returned handle must be kept alive for the life of the process.
///
/// # Errors
///
/// Returns [`FlexiLoggerError`] if the level specification is invalid or a
/// global logger is already installed.
pub fn init_logging(verbosity: u8, quiet: bool) -> Result<LoggerHandle, FlexiLoggerError> {
    Logger::try_with_env_or_str(level_for(verbosity, quiet))?
        .log_to_stderr()
        .format(flexi_logger::default_format)
        .start()
}
