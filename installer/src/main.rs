//! Dynamic plugins installer CLI entrypoint.
//!
//! This binary installs the plugins declared in a plugin source file into the
//! plugins root and writes the merged plugin configuration next to them.

use camino::{Utf8Path, Utf8PathBuf};
use clap::Parser;
use dynamic_plugins_installer::cli::Cli;
use dynamic_plugins_installer::config::InstallConfig;
use dynamic_plugins_installer::error::{InstallerError, Result};
use dynamic_plugins_installer::extraction::TarGzExtractor;
use dynamic_plugins_installer::fetcher::{NpmPack, PackFetcher};
use dynamic_plugins_installer::logging::init_logging;
use dynamic_plugins_installer::output::{summary_message, write_stderr_line};
use dynamic_plugins_installer::pipeline::{InstallSummary, Installer};
use std::io::Write;

fn main() {
    let cli = Cli::parse();
    let mut stderr = std::io::stderr();

    // The handle flushes on drop, so it must outlive the run.
    let _logger = match init_logging(cli.verbosity, cli.quiet) {
        Ok(handle) => Some(handle),
        Err(err) => {
            write_stderr_line(&mut stderr, format!("logging disabled: {err}"));
            None
        }
    };

    let run_result = run(&cli);
    let exit_code = exit_code_for_run_result(run_result, cli.quiet, &mut stderr);
    if exit_code != 0 {
        std::process::exit(exit_code);
    }
}

fn run(cli: &Cli) -> Result<InstallSummary> {
    let config = InstallConfig::from_cli(cli)?;
    let working_dir = current_dir()?;

    let fetcher = PackFetcher::new(
        NpmPack::new(config.fetch_timeout),
        absolute(&working_dir, config.plugins_root.clone()),
        working_dir,
    );
    let extractor = TarGzExtractor::new(config.max_entry_size);

    Installer::new(&config, &fetcher, &extractor).run()
}

fn current_dir() -> Result<Utf8PathBuf> {
    let cwd = std::env::current_dir()?;
    Utf8PathBuf::try_from(cwd).map_err(|err| InstallerError::InvalidSetting {
        name: "working directory",
        value: err.as_path().display().to_string(),
        reason: "not valid UTF-8".to_owned(),
    })
}

fn absolute(base: &Utf8Path, path: Utf8PathBuf) -> Utf8PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

fn exit_code_for_run_result(
    result: Result<InstallSummary>,
    quiet: bool,
    stderr: &mut dyn Write,
) -> i32 {
    match result {
        Ok(summary) => {
            if !quiet {
                write_stderr_line(stderr, summary_message(&summary));
            }
            0
        }
        Err(err) => {
            write_stderr_line(stderr, format!("error: {err}"));
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> InstallSummary {
        InstallSummary {
            total: 2,
            disabled: 1,
            installed: vec!["foo".to_owned()],
            failed: Vec::new(),
            config_path: Utf8PathBuf::from("/root/app-config.dynamic-plugins.yaml"),
        }
    }

    #[test]
    fn exit_code_for_run_result_returns_zero_on_success() {
        let mut stderr = Vec::new();
        let exit_code = exit_code_for_run_result(Ok(summary()), false, &mut stderr);
        assert_eq!(exit_code, 0);

        let stderr_text = String::from_utf8(stderr).expect("stderr was not UTF-8");
        assert!(stderr_text.contains("Installed 1 of 1 plugin"));
    }

    #[test]
    fn quiet_success_prints_nothing() {
        let mut stderr = Vec::new();
        let exit_code = exit_code_for_run_result(Ok(summary()), true, &mut stderr);
        assert_eq!(exit_code, 0);
        assert!(stderr.is_empty());
    }

    #[test]
    fn exit_code_for_run_result_prints_error_and_returns_one() {
        let err = InstallerError::WorkerPanicked { count: 2 };

        let mut stderr = Vec::new();
        let exit_code = exit_code_for_run_result(Err(err), false, &mut stderr);
        assert_eq!(exit_code, 1);

        let stderr_text = String::from_utf8(stderr).expect("stderr was not UTF-8");
        assert!(stderr_text.contains("2 plugin worker(s) panicked"));
    }

    #[test]
    fn relative_roots_are_anchored_to_the_working_directory() {
        let base = Utf8PathBuf::from("/work");
        assert_eq!(
            absolute(&base, Utf8PathBuf::from("dynamic-plugins-root")),
            Utf8PathBuf::from("/work/dynamic-plugins-root")
        );
        assert_eq!(
            absolute(&base, Utf8PathBuf::from("/opt/root")),
            Utf8PathBuf::from("/opt/root")
        );
    }
}
