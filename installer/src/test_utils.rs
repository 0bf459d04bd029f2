//! Shared test utilities for the installer crate.

use crate::fetcher::PackageTool;
use crate::integrity::HashAlgorithm;
use camino::{Utf8Path, Utf8PathBuf};
use flate2::Compression;
use flate2::write::GzEncoder;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Output};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tar::{EntryType, Header};

/// Creates an `ExitStatus` from an exit code (Unix implementation).
#[cfg(unix)]
#[must_use]
pub fn exit_status(code: i32) -> ExitStatus {
    use std::os::unix::process::ExitStatusExt;

    ExitStatus::from_raw(code << 8)
}

/// Creates an `ExitStatus` from an exit code (Windows implementation).
#[cfg(windows)]
#[must_use]
pub fn exit_status(code: i32) -> ExitStatus {
    use std::os::windows::process::ExitStatusExt;

    ExitStatus::from_raw(code.unsigned_abs())
}

/// Creates a successful command `Output` with the given stdout.
#[must_use]
pub fn success_output(stdout: &str) -> Output {
    Output {
        status: exit_status(0),
        stdout: stdout.as_bytes().to_vec(),
        stderr: Vec::new(),
    }
}

/// Creates a failed command `Output` with the given stderr message.
#[must_use]
pub fn failure_output(stderr: &str) -> Output {
    Output {
        status: exit_status(1),
        stdout: Vec::new(),
        stderr: stderr.as_bytes().to_vec(),
    }
}

/// Return the `<algorithm>-<base64>` descriptor for `bytes`.
///
/// # Errors
///
/// Only fails if hashing the in-memory buffer reports an I/O error.
pub fn sri_digest(algorithm: HashAlgorithm, bytes: &[u8]) -> io::Result<String> {
    let mut reader = bytes;
    let digest = algorithm.digest_reader(&mut reader)?;
    Ok(format!("{algorithm}-{digest}"))
}

#[derive(Debug, Clone)]
enum EntryKind {
    Directory,
    File { data: Vec<u8>, mode: u32 },
    Symlink { target: String },
    HardLink { target: String },
    Fifo,
}

#[derive(Debug, Clone)]
struct ArchiveEntry {
    name: String,
    kind: EntryKind,
}

/// Builds gzip-compressed tarballs entry by entry.
///
/// Entry names and link targets are written into the header verbatim, so
/// tests can produce archives containing `..` components, absolute paths
/// and other entries a well-behaved packer would never emit.
#[derive(Debug, Clone, Default)]
pub struct ArchiveBuilder {
    entries: Vec<ArchiveEntry>,
}

impl ArchiveBuilder {
    /// Creates an empty archive.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a directory entry.
    #[must_use]
    pub fn dir(self, name: &str) -> Self {
        self.push(name, EntryKind::Directory)
    }

    /// Adds a regular file with mode `0o644`.
    #[must_use]
    pub fn file(self, name: &str, data: &[u8]) -> Self {
        self.file_with_mode(name, data, 0o644)
    }

    /// Adds a regular file with explicit permission bits.
    #[must_use]
    pub fn file_with_mode(self, name: &str, data: &[u8], mode: u32) -> Self {
        self.push(
            name,
            EntryKind::File {
                data: data.to_vec(),
                mode,
            },
        )
    }

    /// Adds a symbolic link to `target`.
    #[must_use]
    pub fn symlink(self, name: &str, target: &str) -> Self {
        self.push(
            name,
            EntryKind::Symlink {
                target: target.to_owned(),
            },
        )
    }

    /// Adds a hard link to the archive member `target`.
    #[must_use]
    pub fn hard_link(self, name: &str, target: &str) -> Self {
        self.push(
            name,
            EntryKind::HardLink {
                target: target.to_owned(),
            },
        )
    }

    /// Adds a named pipe entry.
    #[must_use]
    pub fn fifo(self, name: &str) -> Self {
        self.push(name, EntryKind::Fifo)
    }

    fn push(mut self, name: &str, kind: EntryKind) -> Self {
        self.entries.push(ArchiveEntry {
            name: name.to_owned(),
            kind,
        });
        self
    }

    /// Encodes the archive as `.tgz` bytes.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if a name or link target exceeds the 100 byte
    /// header field, or if encoding fails.
    pub fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let encoder = GzEncoder::new(Vec::new(), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        for entry in &self.entries {
            let (mut header, data) = entry.header()?;
            header.set_cksum();
            builder.append(&header, data)?;
        }
        builder.into_inner()?.finish()
    }

    /// Writes the archive to `path`.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if encoding or writing fails.
    pub fn write_to(&self, path: &Path) -> io::Result<()> {
        fs::write(path, self.to_bytes()?)
    }
}

impl ArchiveEntry {
    fn header(&self) -> io::Result<(Header, &[u8])> {
        let mut header = Header::new_gnu();
        set_raw_field(&mut header.as_old_mut().name, &self.name)?;
        header.set_mtime(0);
        let data: &[u8] = match &self.kind {
            EntryKind::Directory => {
                header.set_entry_type(EntryType::Directory);
                header.set_mode(0o755);
                &[]
            }
            EntryKind::File { data, mode } => {
                header.set_entry_type(EntryType::Regular);
                header.set_mode(*mode);
                data
            }
            EntryKind::Symlink { target } => {
                header.set_entry_type(EntryType::Symlink);
                header.set_mode(0o777);
                set_raw_field(&mut header.as_old_mut().linkname, target)?;
                &[]
            }
            EntryKind::HardLink { target } => {
                header.set_entry_type(EntryType::Link);
                header.set_mode(0o644);
                set_raw_field(&mut header.as_old_mut().linkname, target)?;
                &[]
            }
            EntryKind::Fifo => {
                header.set_entry_type(EntryType::Fifo);
                header.set_mode(0o644);
                &[]
            }
        };
        header.set_size(data.len() as u64);
        Ok((header, data))
    }
}

/// Copies `value` into a NUL-padded header field, bypassing the path
/// validation `tar` applies in `Header::set_path`.
fn set_raw_field(field: &mut [u8; 100], value: &str) -> io::Result<()> {
    let bytes = value.as_bytes();
    let Some(slot) = field.get_mut(..bytes.len()) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("header field too long: {value}"),
        ));
    };
    slot.copy_from_slice(bytes);
    Ok(())
}

/// A scripted reply from [`StubPackageTool`].
#[derive(Debug, Clone)]
pub enum StubResponse {
    /// Exit successfully, printing the given stdout.
    Stdout(String),
    /// Exit with status 1, printing the given stderr.
    Failure(String),
    /// Report that the tool was killed after its timeout.
    TimedOut,
    /// Write `builder` into the working directory as `file_name` and print
    /// the name, the way `npm pack` does.
    Archive {
        /// The tarball file name.
        file_name: String,
        /// The archive contents.
        builder: ArchiveBuilder,
    },
}

/// A [`PackageTool`] that replies from a script instead of running `npm`.
///
/// Unscripted references fail with [`io::ErrorKind::NotFound`], mirroring a
/// missing executable. Every invocation is recorded.
#[derive(Debug, Default)]
pub struct StubPackageTool {
    responses: HashMap<String, StubResponse>,
    calls: Mutex<Vec<(String, Utf8PathBuf)>>,
    timeout: Option<Duration>,
}

impl StubPackageTool {
    /// Creates a tool with no scripted responses.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the reply for `reference`.
    #[must_use]
    pub fn with_response(mut self, reference: &str, response: StubResponse) -> Self {
        self.responses.insert(reference.to_owned(), response);
        self
    }

    /// Sets the time budget the tool reports, as `npm pack` with a timeout
    /// would.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Returns every `(reference, working_dir)` pair packed so far.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, Utf8PathBuf)> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl PackageTool for StubPackageTool {
    fn pack(&self, reference: &str, working_dir: &Utf8Path) -> io::Result<Output> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((reference.to_owned(), working_dir.to_owned()));

        match self.responses.get(reference) {
            Some(StubResponse::Stdout(stdout)) => Ok(success_output(stdout)),
            Some(StubResponse::Failure(stderr)) => Ok(failure_output(stderr)),
            Some(StubResponse::TimedOut) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "stub package tool timed out",
            )),
            Some(StubResponse::Archive { file_name, builder }) => {
                builder.write_to(working_dir.join(file_name).as_std_path())?;
                Ok(success_output(&format!("{file_name}\n")))
            }
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("no scripted response for {reference}"),
            )),
        }
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }
}
