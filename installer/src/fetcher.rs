//! Package fetching via an external packing tool.
//!
//! The installer does not speak any registry protocol itself. It hands each
//! package reference to `npm pack`, run inside the plugins root, and reads
//! the name of the produced tarball from the tool's standard output.

use crate::plugin::PluginSpec;
use camino::{Utf8Path, Utf8PathBuf};
use log::debug;
use std::io::{self, Read};
use std::process::{Child, Command, Output, Stdio};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use wait_timeout::ChildExt;

/// Errors arising while fetching a package archive.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The packing tool could not be started or its output collected.
    #[error("failed to run package tool for {package}")]
    Spawn {
        /// The package being fetched.
        package: String,
        /// The underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The packing tool exited unsuccessfully.
    #[error("package tool failed for {package} ({status}): {stderr}")]
    ToolFailed {
        /// The package being fetched.
        package: String,
        /// The exit status as reported by the OS.
        status: String,
        /// Captured standard error, trimmed.
        stderr: String,
    },

    /// The packing tool ran past the configured timeout and was killed.
    #[error("package tool for {package} timed out after {}s", timeout.as_secs())]
    TimedOut {
        /// The package being fetched.
        package: String,
        /// The timeout that expired.
        timeout: Duration,
    },

    /// The packing tool succeeded but did not name an archive.
    #[error("package tool for {package} did not report an archive name")]
    NoArchive {
        /// The package being fetched.
        package: String,
    },
}

/// A fetched archive on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedArchive {
    /// Path to the archive.
    pub archive: Utf8PathBuf,
    /// Whether the package came from a local path reference.
    pub is_local: bool,
}

/// Trait for turning a plugin declaration into an archive, enabling test
/// mocking.
#[cfg_attr(test, mockall::automock)]
pub trait PluginFetcher: Send + Sync {
    /// Fetch `plugin` and return the archive location.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] when the archive cannot be produced.
    fn fetch(&self, plugin: &PluginSpec) -> Result<FetchedArchive, FetchError>;
}

/// Abstraction over the external packing tool.
pub trait PackageTool: Send + Sync {
    /// Pack `reference` with `working_dir` as the current directory.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the tool cannot be run. An
    /// [`io::ErrorKind::TimedOut`] error signals that the tool was killed
    /// after exceeding its time budget.
    fn pack(&self, reference: &str, working_dir: &Utf8Path) -> io::Result<Output>;

    /// Return the time budget after which [`PackageTool::pack`] gives up.
    fn timeout(&self) -> Option<Duration>;
}

/// Runs `npm pack` on the host system.
#[derive(Debug, Clone, Copy, Default)]
pub struct NpmPack {
    timeout: Option<Duration>,
}

impl NpmPack {
    /// Create a packer that kills `npm` after `timeout`, if given.
    #[must_use]
    pub const fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

impl PackageTool for NpmPack {
    fn pack(&self, reference: &str, working_dir: &Utf8Path) -> io::Result<Output> {
        let mut command = Command::new("npm");
        command.arg("pack").arg(reference).current_dir(working_dir);
        match self.timeout {
            Some(timeout) => output_with_timeout(&mut command, timeout),
            None => command.output(),
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}

/// Run `command` to completion, killing it once `timeout` elapses.
///
/// Output pipes are drained on helper threads so a chatty child cannot
/// block on a full pipe while we wait on it.
fn output_with_timeout(command: &mut Command, timeout: Duration) -> io::Result<Output> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let Some(status) = child.wait_timeout(timeout)? else {
        kill(&mut child);
        return Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("no exit after {}s", timeout.as_secs()),
        ));
    };

    Ok(Output {
        status,
        stdout: join_drain(stdout)?,
        stderr: join_drain(stderr)?,
    })
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<io::Result<Vec<u8>>> {
    thread::spawn(move || {
        let mut buffer = Vec::new();
        if let Some(mut reader) = pipe {
            reader.read_to_end(&mut buffer)?;
        }
        Ok(buffer)
    })
}

fn join_drain(handle: thread::JoinHandle<io::Result<Vec<u8>>>) -> io::Result<Vec<u8>> {
    handle
        .join()
        .map_err(|_| io::Error::other("output reader thread panicked"))?
}

fn kill(child: &mut Child) {
    if let Err(err) = child.kill() {
        debug!("failed to kill timed out package tool: {err}");
    }
    if let Err(err) = child.wait() {
        debug!("failed to reap timed out package tool: {err}");
    }
}

/// Fetches plugins by packing them into the plugins root.
#[derive(Debug, Clone)]
pub struct PackFetcher<T> {
    tool: T,
    plugins_root: Utf8PathBuf,
    working_dir: Utf8PathBuf,
}

impl<T: PackageTool> PackFetcher<T> {
    /// Create a fetcher writing archives into `plugins_root` and resolving
    /// local references against `working_dir`.
    #[must_use]
    pub fn new(tool: T, plugins_root: Utf8PathBuf, working_dir: Utf8PathBuf) -> Self {
        Self {
            tool,
            plugins_root,
            working_dir,
        }
    }

    /// Return the underlying packing tool.
    #[must_use]
    pub const fn tool(&self) -> &T {
        &self.tool
    }

    /// Return the reference passed to the packing tool for `plugin`.
    ///
    /// Local references are made absolute against the working directory.
    #[must_use]
    pub fn tool_reference(&self, plugin: &PluginSpec) -> String {
        match plugin.local_path() {
            Some(relative) => self.working_dir.join(relative).into_string(),
            None => plugin.package.clone(),
        }
    }
}

impl<T: PackageTool> PluginFetcher for PackFetcher<T> {
    fn fetch(&self, plugin: &PluginSpec) -> Result<FetchedArchive, FetchError> {
        let package = plugin.package.clone();
        let reference = self.tool_reference(plugin);
        debug!("packing {reference} in {}", self.plugins_root);

        let output = self
            .tool
            .pack(&reference, &self.plugins_root)
            .map_err(|source| match (source.kind(), self.tool.timeout()) {
                (io::ErrorKind::TimedOut, Some(timeout)) => FetchError::TimedOut {
                    package: package.clone(),
                    timeout,
                },
                _ => FetchError::Spawn {
                    package: package.clone(),
                    source,
                },
            })?;

        if !output.status.success() {
            return Err(FetchError::ToolFailed {
                package,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            });
        }

        let archive_name = archive_name_from_stdout(&output.stdout)
            .ok_or(FetchError::NoArchive { package })?;
        Ok(FetchedArchive {
            archive: self.plugins_root.join(archive_name),
            is_local: plugin.is_local(),
        })
    }
}

/// Extract the archive file name from the tool's standard output.
///
/// `npm pack` prints the tarball name as its final line; anything before
/// it is progress chatter.
fn archive_name_from_stdout(stdout: &[u8]) -> Option<String> {
    String::from_utf8_lossy(stdout)
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| !line.is_empty())
        .map(str::to_owned)
}
