//! Installation pipeline orchestration.
//!
//! The orchestrator loads the plugin set, hands enabled plugins to a bounded
//! pool of scoped worker threads, and collects each worker's outcome over a
//! channel. Workers fetch, verify and extract; only the orchestrator touches
//! the global configuration, merging fragments in package order once every
//! worker has been joined.

use crate::config::InstallConfig;
use crate::error::{InstallerError, PluginError, Result};
use crate::extraction::{ArchiveExtractor, destination_for};
use crate::fetcher::PluginFetcher;
use crate::integrity::{requires_verification, verify_archive};
use crate::merge::GlobalConfig;
use crate::plugin::PluginSpec;
use crate::sources::load_plugins;
use camino::Utf8PathBuf;
use log::{info, warn};
use serde_yaml::Mapping;
use std::collections::VecDeque;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Mutex, PoisonError};
use std::thread;

/// A plugin that failed without aborting the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedPlugin {
    /// The package reference.
    pub package: String,
    /// Human-readable cause.
    pub reason: String,
}

/// What a completed run did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallSummary {
    /// Number of plugins declared across all source files.
    pub total: usize,
    /// Number of plugins skipped because they are disabled.
    pub disabled: usize,
    /// Packages installed and merged, in merge order.
    pub installed: Vec<String>,
    /// Packages that failed with a non-fatal error.
    pub failed: Vec<FailedPlugin>,
    /// Where the merged configuration was written.
    pub config_path: Utf8PathBuf,
}

impl InstallSummary {
    /// Number of enabled plugins the run attempted.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.installed.len() + self.failed.len()
    }
}

struct PluginOutcome {
    package: String,
    result: std::result::Result<Option<Mapping>, PluginError>,
}

type WorkQueue<'p> = Mutex<VecDeque<&'p PluginSpec>>;

/// Runs an installation against injected fetch and extraction strategies.
pub struct Installer<'a> {
    config: &'a InstallConfig,
    fetcher: &'a dyn PluginFetcher,
    extractor: &'a dyn ArchiveExtractor,
}

impl<'a> Installer<'a> {
    /// Create an installer for `config`.
    #[must_use]
    pub fn new(
        config: &'a InstallConfig,
        fetcher: &'a dyn PluginFetcher,
        extractor: &'a dyn ArchiveExtractor,
    ) -> Self {
        Self {
            config,
            fetcher,
            extractor,
        }
    }

    /// Install every enabled plugin and write the merged configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the plugin sources cannot be loaded, a plugin
    /// fails fatally, a worker panics, or the configuration cannot be
    /// written. Nothing is written when a fatal plugin error occurs.
    pub fn run(&self) -> Result<InstallSummary> {
        let plugins = load_plugins(&self.config.source_file)?;
        info!("found {} plugin(s) in {}", plugins.len(), self.config.source_file);

        let (enabled, disabled): (Vec<&PluginSpec>, Vec<&PluginSpec>) =
            plugins.values().partition(|plugin| !plugin.disabled);
        for plugin in &disabled {
            info!("plugin {} is disabled, skipping", plugin.package);
        }

        fs::create_dir_all(&self.config.plugins_root)?;
        let outcomes = self.process(&enabled)?;

        let mut global = GlobalConfig::seeded();
        let mut installed = Vec::new();
        let mut failed = Vec::new();
        for outcome in outcomes {
            match outcome.result {
                Ok(fragment) => {
                    if let Some(fragment) = fragment {
                        global.merge_fragment(&fragment);
                    }
                    installed.push(outcome.package);
                }
                Err(err) if err.is_fatal() => {
                    return Err(InstallerError::plugin(outcome.package, err));
                }
                Err(err) => {
                    warn!("plugin {} was not installed: {err}", outcome.package);
                    failed.push(FailedPlugin {
                        package: outcome.package,
                        reason: err.to_string(),
                    });
                }
            }
        }

        let config_path = self.config.global_config_path();
        global
            .write_to(&config_path)
            .map_err(|source| InstallerError::ConfigWrite {
                path: config_path.clone(),
                source,
            })?;
        info!("wrote merged plugin configuration to {config_path}");

        Ok(InstallSummary {
            total: plugins.len(),
            disabled: disabled.len(),
            installed,
            failed,
            config_path,
        })
    }

    /// Run `plugins` through the worker pool and return outcomes sorted by
    /// package.
    fn process(&self, plugins: &[&PluginSpec]) -> Result<Vec<PluginOutcome>> {
        if plugins.is_empty() {
            return Ok(Vec::new());
        }

        let workers = self.config.jobs.get().min(plugins.len());
        let queue: WorkQueue<'_> = Mutex::new(plugins.iter().copied().collect());
        let abort = AtomicBool::new(false);
        let (sender, receiver) = mpsc::channel();

        let panicked = thread::scope(|scope| {
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    let sender = sender.clone();
                    let (queue, abort) = (&queue, &abort);
                    scope.spawn(move || self.work(queue, abort, &sender))
                })
                .collect();
            handles
                .into_iter()
                .map(thread::ScopedJoinHandle::join)
                .filter(std::result::Result::is_err)
                .count()
        });
        drop(sender);

        if panicked > 0 {
            return Err(InstallerError::WorkerPanicked { count: panicked });
        }

        let mut outcomes: Vec<PluginOutcome> = receiver.into_iter().collect();
        outcomes.sort_by(|a, b| a.package.cmp(&b.package));
        Ok(outcomes)
    }

    fn work(&self, queue: &WorkQueue<'_>, abort: &AtomicBool, results: &Sender<PluginOutcome>) {
        while !abort.load(Ordering::Acquire) {
            let next = queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some(plugin) = next else {
                break;
            };

            let result = self.install_plugin(plugin);
            if result.as_ref().is_err_and(PluginError::is_fatal) {
                abort.store(true, Ordering::Release);
            }
            let outcome = PluginOutcome {
                package: plugin.package.clone(),
                result,
            };
            if results.send(outcome).is_err() {
                break;
            }
        }
    }

    /// Fetch, verify and extract one plugin, returning its config fragment.
    fn install_plugin(
        &self,
        plugin: &PluginSpec,
    ) -> std::result::Result<Option<Mapping>, PluginError> {
        info!("installing plugin {}", plugin.package);
        let fetched = self.fetcher.fetch(plugin)?;
        let archive = fetched.archive.as_std_path();

        if requires_verification(fetched.is_local, self.config.skip_integrity_check) {
            verify_archive(plugin, archive)?;
            info!("integrity check passed for {}", plugin.package);
        }

        let destination = destination_for(archive)?;
        let report = self.extractor.extract(archive, &destination)?;
        info!(
            "extracted {} file(s) for {} into {}",
            report.written.len(),
            plugin.package,
            destination.display()
        );
        Ok(plugin.plugin_config.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{ExtractionError, ExtractionReport, MockArchiveExtractor};
    use crate::fetcher::{FetchError, FetchedArchive, MockPluginFetcher};
    use crate::integrity::{HashAlgorithm, IntegrityError};
    use crate::test_utils::sri_digest;
    use rstest::{fixture, rstest};
    use std::num::NonZeroUsize;
    use tempfile::TempDir;

    const ARCHIVE_BYTES: &[u8] = b"not really a tarball";

    struct Scratch {
        dir: TempDir,
    }

    impl Scratch {
        fn path(&self, name: &str) -> Utf8PathBuf {
            Utf8PathBuf::try_from(self.dir.path().join(name)).expect("utf8 temp path")
        }

        fn sources(&self, yaml: &str) -> Utf8PathBuf {
            let path = self.path("plugins.yaml");
            fs::write(&path, yaml).expect("write sources");
            path
        }

        fn config(&self, yaml: &str, jobs: usize) -> InstallConfig {
            InstallConfig {
                jobs: NonZeroUsize::new(jobs).expect("non-zero jobs"),
                ..InstallConfig::new(self.path("root"), self.sources(yaml))
            }
        }

        /// Write the fetched archive for `package` and return where it lives.
        fn archive_for(&self, package: &str) -> Utf8PathBuf {
            let root = self.path("root");
            fs::create_dir_all(&root).expect("create root");
            let name = package.trim_start_matches("./").replace('/', "-");
            let path = root.join(format!("{name}-1.0.0.tgz"));
            fs::write(&path, ARCHIVE_BYTES).expect("write archive");
            path
        }
    }

    #[fixture]
    fn scratch() -> Scratch {
        Scratch {
            dir: tempfile::tempdir().expect("temp dir"),
        }
    }

    fn good_digest() -> String {
        sri_digest(HashAlgorithm::Sha512, ARCHIVE_BYTES).expect("digest")
    }

    fn fetcher_for(scratch: &Scratch, packages: &[&str]) -> MockPluginFetcher {
        let archives: Vec<(String, Utf8PathBuf)> = packages
            .iter()
            .map(|p| ((*p).to_owned(), scratch.archive_for(p)))
            .collect();
        let mut fetcher = MockPluginFetcher::new();
        fetcher.expect_fetch().returning(move |plugin| {
            archives
                .iter()
                .find(|(package, _)| *package == plugin.package)
                .map(|(_, archive)| FetchedArchive {
                    archive: archive.clone(),
                    is_local: plugin.is_local(),
                })
                .ok_or_else(|| FetchError::NoArchive {
                    package: plugin.package.clone(),
                })
        });
        fetcher
    }

    fn succeeding_extractor() -> MockArchiveExtractor {
        let mut extractor = MockArchiveExtractor::new();
        extractor
            .expect_extract()
            .returning(|_, _| Ok(ExtractionReport::default()));
        extractor
    }

    #[rstest]
    #[case::single_worker(1)]
    #[case::many_workers(8)]
    fn merges_fragments_in_package_order(scratch: Scratch, #[case] jobs: usize) {
        let digest = good_digest();
        let config = scratch.config(
            &format!(
                concat!(
                    "plugins:\n",
                    "  - package: zeta\n    integrity: {d}\n    pluginConfig: {{shared: zeta, z: 1}}\n",
                    "  - package: alpha\n    integrity: {d}\n    pluginConfig: {{shared: alpha, a: 1}}\n",
                    "  - package: mid\n    integrity: {d}\n    pluginConfig: {{shared: mid}}\n",
                ),
                d = digest
            ),
            jobs,
        );
        let fetcher = fetcher_for(&scratch, &["zeta", "alpha", "mid"]);
        let extractor = succeeding_extractor();

        let summary = Installer::new(&config, &fetcher, &extractor)
            .run()
            .expect("run");

        assert_eq!(summary.installed, vec!["alpha", "mid", "zeta"]);
        let written: Mapping =
            serde_yaml::from_str(&fs::read_to_string(&summary.config_path).expect("read config"))
                .expect("parse config");
        assert_eq!(written.get("shared"), Some(&serde_yaml::Value::from("zeta")));
        assert_eq!(written.get("a"), Some(&serde_yaml::Value::from(1)));
        assert!(written.contains_key("dynamicPlugins"));
    }

    #[rstest]
    fn disabled_plugins_are_never_fetched(scratch: Scratch) {
        let config = scratch.config(
            "plugins:\n  - package: dormant\n    disabled: true\n    pluginConfig: {dormant: true}\n",
            2,
        );
        let mut fetcher = MockPluginFetcher::new();
        fetcher.expect_fetch().never();
        let mut extractor = MockArchiveExtractor::new();
        extractor.expect_extract().never();

        let summary = Installer::new(&config, &fetcher, &extractor)
            .run()
            .expect("run");

        assert_eq!(summary.total, 1);
        assert_eq!(summary.disabled, 1);
        assert!(summary.installed.is_empty());
        let written = fs::read_to_string(&summary.config_path).expect("read config");
        assert!(!written.contains("dormant"));
    }

    #[rstest]
    fn fetch_failure_is_isolated(scratch: Scratch) {
        let digest = good_digest();
        let config = scratch.config(
            &format!(
                "plugins:\n  - package: good\n    integrity: {digest}\n    pluginConfig: {{good: 1}}\n  - package: missing\n    pluginConfig: {{missing: 1}}\n"
            ),
            2,
        );
        let fetcher = fetcher_for(&scratch, &["good"]);
        let extractor = succeeding_extractor();

        let summary = Installer::new(&config, &fetcher, &extractor)
            .run()
            .expect("non-fatal failure still completes");

        assert_eq!(summary.installed, vec!["good"]);
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(summary.failed.first().map(|f| f.package.as_str()), Some("missing"));
        let written = fs::read_to_string(&summary.config_path).expect("read config");
        assert!(written.contains("good"));
        assert!(!written.contains("missing"));
    }

    #[rstest]
    fn integrity_mismatch_aborts_without_writing(scratch: Scratch) {
        let wrong = sri_digest(HashAlgorithm::Sha512, b"something else").expect("digest");
        let config = scratch.config(
            &format!("plugins:\n  - package: tampered\n    integrity: {wrong}\n"),
            1,
        );
        let fetcher = fetcher_for(&scratch, &["tampered"]);
        let mut extractor = MockArchiveExtractor::new();
        extractor.expect_extract().never();

        let err = Installer::new(&config, &fetcher, &extractor)
            .run()
            .expect_err("mismatch is fatal");

        assert!(matches!(
            err,
            InstallerError::Plugin {
                source: PluginError::Integrity(IntegrityError::Mismatch { .. }),
                ..
            }
        ));
        assert!(!config.global_config_path().exists());
    }

    #[rstest]
    fn local_plugins_are_verified_even_when_skipping(scratch: Scratch) {
        let mut config = scratch.config("plugins:\n  - package: ./local/foo\n", 1);
        config.skip_integrity_check = true;
        let fetcher = fetcher_for(&scratch, &["./local/foo"]);
        let mut extractor = MockArchiveExtractor::new();
        extractor.expect_extract().never();

        let err = Installer::new(&config, &fetcher, &extractor)
            .run()
            .expect_err("missing descriptor on a local plugin is fatal");
        assert!(matches!(
            err,
            InstallerError::Plugin {
                source: PluginError::Integrity(IntegrityError::Format { .. }),
                ..
            }
        ));
    }

    #[rstest]
    fn registry_plugins_skip_verification_when_asked(scratch: Scratch) {
        let mut config = scratch.config("plugins:\n  - package: '@scope/foo'\n", 1);
        config.skip_integrity_check = true;
        let fetcher = fetcher_for(&scratch, &["@scope/foo"]);
        let extractor = succeeding_extractor();

        let summary = Installer::new(&config, &fetcher, &extractor)
            .run()
            .expect("run");
        assert_eq!(summary.installed, vec!["@scope/foo"]);
    }

    #[rstest]
    #[case::path_escape(ExtractionError::PathEscape { entry: "../x".to_owned() }, true)]
    #[case::io(ExtractionError::Io(std::io::Error::other("disk full")), false)]
    fn extraction_failures_are_classified(
        scratch: Scratch,
        #[case] failure: ExtractionError,
        #[case] fatal: bool,
    ) {
        let config = scratch.config(
            &format!("plugins:\n  - package: foo\n    integrity: {}\n", good_digest()),
            1,
        );
        let fetcher = fetcher_for(&scratch, &["foo"]);
        let mut failure = Some(failure);
        let mut extractor = MockArchiveExtractor::new();
        extractor
            .expect_extract()
            .times(1)
            .returning(move |_, _| Err(failure.take().expect("extract called once")));

        let result = Installer::new(&config, &fetcher, &extractor).run();

        if fatal {
            assert!(result.is_err());
            assert!(!config.global_config_path().exists());
        } else {
            let summary = result.expect("non-fatal extraction failure");
            assert!(summary.installed.is_empty());
            assert_eq!(summary.failed.len(), 1);
            assert!(summary.config_path.exists());
        }
    }

    #[rstest]
    fn missing_source_file_is_fatal(scratch: Scratch) {
        let config = InstallConfig::new(scratch.path("root"), scratch.path("absent.yaml"));
        let fetcher = MockPluginFetcher::new();
        let extractor = MockArchiveExtractor::new();

        let err = Installer::new(&config, &fetcher, &extractor)
            .run()
            .expect_err("missing sources");
        assert!(matches!(err, InstallerError::Source(_)));
    }

    #[rstest]
    fn worker_panic_is_reported(scratch: Scratch) {
        let config = scratch.config("plugins:\n  - package: boom\n", 1);
        let mut fetcher = MockPluginFetcher::new();
        fetcher
            .expect_fetch()
            .returning(|_| panic!("fetcher exploded"));
        let extractor = MockArchiveExtractor::new();

        let err = Installer::new(&config, &fetcher, &extractor)
            .run()
            .expect_err("panic surfaces as an error");
        assert!(matches!(err, InstallerError::WorkerPanicked { count: 1 }));
    }
}
