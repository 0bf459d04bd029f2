//! Output formatting for the installer CLI.
//!
//! Progress goes through the logger; this module only renders the final
//! run summary and provides the best-effort stderr writer the binary uses
//! for it.

use crate::pipeline::InstallSummary;
use std::io::Write;

/// Writes a line to stderr, ignoring write failures.
///
/// This is used for user-facing status messages where failure to write
/// should not abort the operation.
pub fn write_stderr_line(stderr: &mut dyn Write, message: impl std::fmt::Display) {
    if writeln!(stderr, "{message}").is_err() {
        // Best-effort logging; ignore write failures.
    }
}

/// Format the closing summary of a completed run.
///
/// # Example
///
/// ```
/// use camino::Utf8PathBuf;
/// use dynamic_plugins_installer::output::summary_message;
/// use dynamic_plugins_installer::pipeline::InstallSummary;
///
/// let summary = InstallSummary {
///     total: 3,
///     disabled: 1,
///     installed: vec!["a".to_owned(), "b".to_owned()],
///     failed: Vec::new(),
///     config_path: Utf8PathBuf::from("/root/app-config.dynamic-plugins.yaml"),
/// };
///
/// let text = summary_message(&summary);
/// assert!(text.starts_with("Installed 2 of 2 plugins"));
/// ```
#[must_use]
pub fn summary_message(summary: &InstallSummary) -> String {
    let attempted = summary.attempted();
    let noun = if attempted == 1 { "plugin" } else { "plugins" };
    let mut lines = vec![format!(
        "Installed {} of {attempted} {noun} ({} disabled); configuration written to {}",
        summary.installed.len(),
        summary.disabled,
        summary.config_path
    )];

    if !summary.failed.is_empty() {
        lines.push("Failed plugins:".to_owned());
        lines.extend(
            summary
                .failed
                .iter()
                .map(|failure| format!("  - {}: {}", failure.package, failure.reason)),
        );
    }

    lines.join("\n")
}
