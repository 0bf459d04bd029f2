//! Archive extraction for fetched plugin tarballs.
//!
//! Plugin archives are gzip-compressed tar streams whose entries all live
//! under a single `package/` directory. Extraction strips that prefix and
//! refuses any entry that would land outside it (zip-slip) or whose declared
//! size exceeds the configured ceiling (zip-bomb).
//!
//! Entries are unpacked into a staging directory beside the destination and
//! moved into place only once the whole archive has been accepted, so a
//! rejected archive never leaves a half-populated plugin directory behind.

use flate2::read::GzDecoder;
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Component, Path, PathBuf};
use tar::{Archive, Entry, EntryType};

/// Directory every archive entry must live under.
pub const PACKAGE_ROOT: &str = "package";

/// Default per-entry size ceiling in bytes.
pub const DEFAULT_MAX_ENTRY_SIZE: u64 = 20_000_000;

const ARCHIVE_SUFFIXES: [&str; 2] = [".tgz", ".tar.gz"];

/// Links followed while resolving one staged symbolic link.
const MAX_LINK_HOPS: usize = 40;

/// Trait for extracting plugin archives, enabling test mocking.
#[cfg_attr(test, mockall::automock)]
pub trait ArchiveExtractor: Send + Sync {
    /// Extract the archive at `archive` so that its `package/` contents
    /// become the contents of `dest`.
    ///
    /// # Errors
    ///
    /// Returns [`ExtractionError::PathEscape`] or
    /// [`ExtractionError::LinkEscape`] if an entry escapes the package root,
    /// [`ExtractionError::OversizeEntry`] if a file exceeds the size
    /// ceiling, and [`ExtractionError::Io`] on other failures.
    fn extract(&self, archive: &Path, dest: &Path) -> Result<ExtractionReport, ExtractionError>;
}

/// Errors arising from archive extraction.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    /// I/O or decoding error during extraction.
    #[error("extraction I/O error: {0}")]
    Io(#[from] io::Error),

    /// An entry name does not resolve under the package root.
    #[error("entry {entry:?} does not resolve under 'package/'")]
    PathEscape {
        /// The offending entry name.
        entry: String,
    },

    /// A link entry points outside the package root.
    #[error("link {entry:?} points outside 'package/': {target:?}")]
    LinkEscape {
        /// The link entry name.
        entry: String,
        /// The recorded link target.
        target: String,
    },

    /// A file entry declares more bytes than the ceiling allows.
    #[error("entry {entry:?} declares {size} bytes, above the {limit} byte limit")]
    OversizeEntry {
        /// The offending entry name.
        entry: String,
        /// The declared size.
        size: u64,
        /// The configured ceiling.
        limit: u64,
    },

    /// The archive file name does not carry a recognised tarball suffix.
    #[error("cannot derive a plugin directory from archive name {}", path.display())]
    UnrecognisedArchiveName {
        /// The archive path.
        path: PathBuf,
    },
}

impl ExtractionError {
    /// Return true when the archive itself is hostile or malformed in a way
    /// that must halt the whole installation.
    #[must_use]
    pub const fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::PathEscape { .. } | Self::LinkEscape { .. } | Self::OversizeEntry { .. }
        )
    }
}

/// Summary of one successful extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionReport {
    /// Paths written, relative to the destination directory.
    pub written: Vec<PathBuf>,
    /// Entry names skipped because their kind is not supported.
    pub skipped: Vec<String>,
}

/// Production extractor for gzip-compressed tarballs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TarGzExtractor {
    max_entry_size: u64,
}

impl TarGzExtractor {
    /// Create an extractor enforcing `max_entry_size` bytes per file.
    #[must_use]
    pub const fn new(max_entry_size: u64) -> Self {
        Self { max_entry_size }
    }
}

impl Default for TarGzExtractor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRY_SIZE)
    }
}

impl ArchiveExtractor for TarGzExtractor {
    fn extract(&self, archive: &Path, dest: &Path) -> Result<ExtractionReport, ExtractionError> {
        let parent = dest
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let staging = tempfile::Builder::new()
            .prefix(".extracting-")
            .tempdir_in(parent)?;

        let report = self.unpack_into(archive, staging.path())?;
        verify_staged_links(staging.path())?;
        set_directory_mode(staging.path())?;

        reset_destination(dest);
        fs::rename(staging.path(), dest)?;
        debug!(
            "extracted {} file(s) from {} into {}",
            report.written.len(),
            archive.display(),
            dest.display()
        );
        Ok(report)
    }
}

impl TarGzExtractor {
    fn unpack_into(&self, archive: &Path, staging: &Path) -> Result<ExtractionReport, ExtractionError> {
        let file = File::open(archive)?;
        let mut tarball = Archive::new(GzDecoder::new(BufReader::new(file)));
        let mut report = ExtractionReport::default();
        debug!(
            "unpacking {} with a {} byte entry ceiling",
            archive.display(),
            self.max_entry_size
        );

        for entry_result in tarball.entries()? {
            let mut entry = entry_result?;
            let name = entry.path()?.to_string_lossy().into_owned();
            let kind = entry.header().entry_type();

            if kind.is_dir() {
                continue;
            }
            if is_regular(kind) {
                let relative = contained_path(&name)?;
                self.check_size(&name, entry.size())?;
                write_file(&mut entry, staging, &relative, &name)?;
                report.written.push(relative);
            } else if kind.is_symlink() || kind.is_hard_link() {
                let relative = contained_path(&name)?;
                let target = link_target(&entry, &name)?;
                if write_link(kind, staging, &relative, &name, &target)? {
                    report.written.push(relative);
                } else {
                    report.skipped.push(name);
                }
            } else {
                info!("skipping irregular entry {name} ({kind:?}) in {}", archive.display());
                report.skipped.push(name);
            }
        }

        Ok(report)
    }

    fn check_size(&self, name: &str, size: u64) -> Result<(), ExtractionError> {
        if size > self.max_entry_size {
            return Err(ExtractionError::OversizeEntry {
                entry: name.to_owned(),
                size,
                limit: self.max_entry_size,
            });
        }
        Ok(())
    }
}

/// Derive the plugin directory for an archive by dropping its tarball
/// suffix, so `root/foo-1.0.0.tgz` extracts into `root/foo-1.0.0`.
///
/// # Errors
///
/// Returns [`ExtractionError::UnrecognisedArchiveName`] when the file name
/// has no tarball suffix or nothing precedes it.
pub fn destination_for(archive: &Path) -> Result<PathBuf, ExtractionError> {
    let unrecognised = || ExtractionError::UnrecognisedArchiveName {
        path: archive.to_owned(),
    };
    let file_name = archive
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(unrecognised)?;
    let stem = ARCHIVE_SUFFIXES
        .iter()
        .find_map(|suffix| file_name.strip_suffix(suffix))
        .filter(|stem| !stem.is_empty())
        .ok_or_else(unrecognised)?;
    Ok(archive.with_file_name(stem))
}

fn is_regular(kind: EntryType) -> bool {
    kind.is_file() || kind.is_contiguous()
}

/// Normalize `name` lexically and return the path beneath `package/`.
///
/// Rejects absolute names, names outside the package root, names that climb
/// above it, and the bare root itself.
fn contained_path(name: &str) -> Result<PathBuf, ExtractionError> {
    let escape = || ExtractionError::PathEscape {
        entry: name.to_owned(),
    };
    let mut components = Path::new(name)
        .components()
        .skip_while(|c| matches!(c, Component::CurDir));
    match components.next() {
        Some(Component::Normal(root)) if root == PACKAGE_ROOT => {}
        _ => return Err(escape()),
    }
    let relative = resolve_within(Vec::new(), components).ok_or_else(escape)?;
    if relative.as_os_str().is_empty() {
        return Err(escape());
    }
    Ok(relative)
}

/// Apply `components` on top of `stack`, returning `None` if they climb
/// above the package root or are absolute.
fn resolve_within<'a>(
    mut stack: Vec<&'a std::ffi::OsStr>,
    components: impl Iterator<Item = Component<'a>>,
) -> Option<PathBuf> {
    for component in components {
        match component {
            Component::Normal(part) => stack.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                stack.pop()?;
            }
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(stack.into_iter().collect())
}

fn link_target<R: io::Read>(entry: &Entry<'_, R>, name: &str) -> Result<String, ExtractionError> {
    let target = entry.link_name()?.ok_or_else(|| ExtractionError::LinkEscape {
        entry: name.to_owned(),
        target: String::new(),
    })?;
    Ok(target.to_string_lossy().into_owned())
}

/// Check that a link target stays inside the package root.
///
/// Symbolic link targets are relative to the link's own directory; hard
/// link targets are archive names. A symbolic link target may not step back
/// out of a directory that is itself a symbolic link, since the lexical and
/// physical parents differ there.
fn check_link_target(
    kind: EntryType,
    staging: &Path,
    relative: &Path,
    name: &str,
    target: &str,
) -> Result<PathBuf, ExtractionError> {
    let escape = || ExtractionError::LinkEscape {
        entry: name.to_owned(),
        target: target.to_owned(),
    };
    if kind.is_hard_link() {
        let resolved = contained_path(target).map_err(|_| escape())?;
        ensure_no_linked_parent(staging, &resolved, name)?;
        return Ok(resolved);
    }

    let mut stack: Vec<&std::ffi::OsStr> = relative
        .parent()
        .into_iter()
        .flat_map(|parent| parent.iter())
        .collect();
    for component in Path::new(target).components() {
        match component {
            Component::Normal(part) => stack.push(part),
            Component::CurDir => {}
            Component::ParentDir => {
                let current: PathBuf = stack.iter().collect();
                if is_symlink(&staging.join(&current)) {
                    return Err(escape());
                }
                stack.pop().ok_or_else(escape)?;
            }
            Component::RootDir | Component::Prefix(_) => return Err(escape()),
        }
    }
    Ok(stack.into_iter().collect())
}

/// One step of a symbolic link walk.
enum Step {
    Down(OsString),
    Up,
}

/// Split a link target into walk steps, or `None` for absolute targets.
fn steps(target: &Path) -> Option<Vec<Step>> {
    let mut steps = Vec::new();
    for component in target.components() {
        match component {
            Component::Normal(part) => steps.push(Step::Down(part.to_owned())),
            Component::CurDir => {}
            Component::ParentDir => steps.push(Step::Up),
            Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(steps)
}

/// Resolve every symbolic link in the staged tree against the tree itself.
///
/// Entry order can turn a lexically contained target into an escape once a
/// later entry replaces one of its components with a link, so the per-entry
/// checks are repeated physically after unpacking.
fn verify_staged_links(staging: &Path) -> Result<(), ExtractionError> {
    for link in staged_symlinks(staging)? {
        if !resolves_within(staging, &link) {
            let target = fs::read_link(staging.join(&link))?;
            return Err(ExtractionError::LinkEscape {
                entry: Path::new(PACKAGE_ROOT).join(&link).to_string_lossy().into_owned(),
                target: target.to_string_lossy().into_owned(),
            });
        }
    }
    Ok(())
}

/// List staged symbolic links, relative to `staging`, without following them.
fn staged_symlinks(staging: &Path) -> io::Result<Vec<PathBuf>> {
    let mut links = Vec::new();
    let mut pending = vec![PathBuf::new()];
    while let Some(relative) = pending.pop() {
        for entry in fs::read_dir(staging.join(&relative))? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = relative.join(entry.file_name());
            if file_type.is_symlink() {
                links.push(path);
            } else if file_type.is_dir() {
                pending.push(path);
            }
        }
    }
    links.sort();
    Ok(links)
}

/// Walk `link` component by component, expanding every link met on the
/// way, and report whether the walk stays inside `staging`.
fn resolves_within(staging: &Path, link: &Path) -> bool {
    let Some(initial) = steps(link) else {
        return false;
    };
    let mut pending: VecDeque<Step> = initial.into();
    let mut stack: Vec<OsString> = Vec::new();
    let mut hops = 0_usize;

    while let Some(step) = pending.pop_front() {
        match step {
            Step::Up => {
                if stack.pop().is_none() {
                    return false;
                }
            }
            Step::Down(part) => {
                stack.push(part);
                let current = staging.join(stack.iter().collect::<PathBuf>());
                let Ok(target) = fs::read_link(&current) else {
                    continue;
                };
                hops = hops.saturating_add(1);
                if hops > MAX_LINK_HOPS {
                    return false;
                }
                stack.pop();
                let Some(expanded) = steps(&target) else {
                    return false;
                };
                for step in expanded.into_iter().rev() {
                    pending.push_front(step);
                }
            }
        }
    }
    true
}

fn is_symlink(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok_and(|meta| meta.file_type().is_symlink())
}

/// Reject entries whose parent directories include an extracted symbolic
/// link, so nothing is ever written through a link.
fn ensure_no_linked_parent(staging: &Path, relative: &Path, name: &str) -> Result<(), ExtractionError> {
    let mut current = staging.to_path_buf();
    for part in relative.parent().into_iter().flat_map(Path::iter) {
        current.push(part);
        if is_symlink(&current) {
            return Err(ExtractionError::PathEscape {
                entry: name.to_owned(),
            });
        }
    }
    Ok(())
}

fn write_file<R: io::Read>(
    entry: &mut Entry<'_, R>,
    staging: &Path,
    relative: &Path,
    name: &str,
) -> Result<(), ExtractionError> {
    ensure_no_linked_parent(staging, relative, name)?;
    let mode = entry.header().mode()?;
    let out_path = staging.join(relative);
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = File::create(&out_path)?;
    io::copy(entry, &mut out)?;
    drop(out);
    set_file_mode(&out_path, mode)?;
    Ok(())
}

/// Recreate a link entry, returning `false` when links are unsupported on
/// this platform and the entry was skipped.
fn write_link(
    kind: EntryType,
    staging: &Path,
    relative: &Path,
    name: &str,
    target: &str,
) -> Result<bool, ExtractionError> {
    ensure_no_linked_parent(staging, relative, name)?;
    let resolved = check_link_target(kind, staging, relative, name, target)?;
    let out_path = staging.join(relative);
    if let Some(parent) = out_path.parent() {
        fs::create_dir_all(parent)?;
    }
    if kind.is_hard_link() {
        fs::hard_link(staging.join(resolved), &out_path)?;
        return Ok(true);
    }
    write_symlink(target, &out_path)
}

#[cfg(unix)]
fn write_symlink(target: &str, out_path: &Path) -> Result<bool, ExtractionError> {
    std::os::unix::fs::symlink(target, out_path)?;
    Ok(true)
}

#[cfg(not(unix))]
fn write_symlink(target: &str, out_path: &Path) -> Result<bool, ExtractionError> {
    info!(
        "skipping symbolic link {} -> {target}: unsupported on this platform",
        out_path.display()
    );
    Ok(false)
}

#[cfg(unix)]
fn set_file_mode(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o777))
}

#[cfg(not(unix))]
fn set_file_mode(_path: &Path, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn set_directory_mode(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn set_directory_mode(_path: &Path) -> io::Result<()> {
    Ok(())
}

/// Remove a previous installation, tolerating its absence.
fn reset_destination(dest: &Path) {
    match fs::remove_dir_all(dest) {
        Ok(()) => debug!("removed previous plugin directory {}", dest.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(
            "removing previous plugin directory {} failed, trying to continue: {err}",
            dest.display()
        ),
    }
}
