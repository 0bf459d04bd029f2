//! Subresource-integrity verification for fetched plugin archives.
//!
//! A descriptor has the form `<algorithm>-<base64 digest>`, for example
//! `sha512-z4PhNX7vuL3xVChQ1m2AB9Yg5AULVxXcg/SpIdNs6c5H0NE8XYXysP+DGNKHfuwvY7kxvUdBeoGlODJ6+SfaPg==`.
//! The digest is computed over the whole archive and compared against the
//! descriptor with standard padded base64 encoding.

use crate::plugin::PluginSpec;
use base64::prelude::{BASE64_STANDARD, Engine as _};
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors arising from integrity verification.
#[derive(Debug, Error)]
pub enum IntegrityError {
    /// The descriptor is missing, empty, or not `<algorithm>-<digest>`.
    #[error(
        "plugin {package} integrity value {value:?} is missing or malformed; \
         expected sha512-<digest>, sha384-<digest> or sha256-<digest>"
    )]
    Format {
        /// The plugin whose descriptor was rejected.
        package: String,
        /// The raw descriptor.
        value: String,
    },

    /// The descriptor names an algorithm outside the supported set.
    #[error("plugin {package} uses unsupported integrity algorithm {algorithm:?}")]
    UnsupportedAlgorithm {
        /// The plugin whose descriptor was rejected.
        package: String,
        /// The algorithm token from the descriptor.
        algorithm: String,
    },

    /// The archive digest does not match the descriptor.
    #[error(
        "integrity check failed for plugin {package}: wanted {expected:?}, got {actual:?} ({algorithm})"
    )]
    Mismatch {
        /// The plugin whose archive failed verification.
        package: String,
        /// The digest algorithm used.
        algorithm: HashAlgorithm,
        /// The digest from the descriptor.
        expected: String,
        /// The digest computed from the archive.
        actual: String,
    },

    /// The archive could not be read.
    #[error("failed to read archive {} for integrity check", path.display())]
    Io {
        /// The archive path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

impl IntegrityError {
    /// Return true when the failure indicates tampering or a bad descriptor
    /// rather than a local I/O problem.
    #[must_use]
    pub const fn is_security_violation(&self) -> bool {
        !matches!(self, Self::Io { .. })
    }
}

/// Digest algorithms accepted in integrity descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// SHA-512.
    Sha512,
    /// SHA-384.
    Sha384,
    /// SHA-256.
    Sha256,
}

impl HashAlgorithm {
    /// Return the descriptor token for this algorithm.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Sha512 => "sha512",
            Self::Sha384 => "sha384",
            Self::Sha256 => "sha256",
        }
    }

    /// Look up an algorithm by its descriptor token.
    #[must_use]
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "sha512" => Some(Self::Sha512),
            "sha384" => Some(Self::Sha384),
            "sha256" => Some(Self::Sha256),
            _ => None,
        }
    }

    /// Hash everything readable from `reader`, returning the base64 digest.
    ///
    /// # Errors
    ///
    /// Returns any I/O error raised by `reader`.
    pub fn digest_reader(self, reader: &mut dyn Read) -> std::io::Result<String> {
        let raw = match self {
            Self::Sha512 => hash_stream::<Sha512>(reader)?,
            Self::Sha384 => hash_stream::<Sha384>(reader)?,
            Self::Sha256 => hash_stream::<Sha256>(reader)?,
        };
        Ok(BASE64_STANDARD.encode(raw))
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn hash_stream<D: Digest>(reader: &mut dyn Read) -> std::io::Result<Vec<u8>> {
    let mut hasher = D::new();
    let mut buffer = [0u8; 8192];
    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(buffer.get(..bytes_read).unwrap_or_default());
    }
    Ok(hasher.finalize().to_vec())
}

/// A parsed integrity descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityDescriptor {
    algorithm: HashAlgorithm,
    digest: String,
}

impl IntegrityDescriptor {
    /// Parse the descriptor declared by `plugin`.
    ///
    /// # Errors
    ///
    /// Returns [`IntegrityError::Format`] when the descriptor is absent,
    /// empty, or does not split into exactly two `-` separated parts, and
    /// [`IntegrityError::UnsupportedAlgorithm`] for unknown algorithms.
    pub fn for_plugin(plugin: &PluginSpec) -> Result<Self, IntegrityError> {
        let raw = plugin.integrity.as_deref().unwrap_or_default();
        Self::parse(&plugin.package, raw)
    }

    /// Parse `value` on behalf of `package`.
    ///
    /// # Errors
    ///
    /// See [`IntegrityDescriptor::for_plugin`].
    ///
    /// # Examples
    ///
    /// ```
    /// use dynamic_plugins_installer::integrity::{HashAlgorithm, IntegrityDescriptor};
    ///
    /// let descriptor = IntegrityDescriptor::parse("foo", "sha384-abc=").unwrap();
    /// assert_eq!(descriptor.algorithm(), HashAlgorithm::Sha384);
    /// assert_eq!(descriptor.digest(), "abc=");
    /// ```
    pub fn parse(package: &str, value: &str) -> Result<Self, IntegrityError> {
        let format_error = || IntegrityError::Format {
            package: package.to_owned(),
            value: value.to_owned(),
        };

        let mut parts = value.split('-');
        let (Some(token), Some(digest), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(format_error());
        };
        if token.is_empty() || digest.is_empty() {
            return Err(format_error());
        }

        let algorithm =
            HashAlgorithm::from_token(token).ok_or_else(|| IntegrityError::UnsupportedAlgorithm {
                package: package.to_owned(),
                algorithm: token.to_owned(),
            })?;

        Ok(Self {
            algorithm,
            digest: digest.to_owned(),
        })
    }

    /// Return the digest algorithm.
    #[must_use]
    pub const fn algorithm(&self) -> HashAlgorithm {
        self.algorithm
    }

    /// Return the expected base64 digest.
    #[must_use]
    pub fn digest(&self) -> &str {
        &self.digest
    }
}

/// Decide whether a fetched archive must be verified.
///
/// Local packages are always verified. Registry packages are verified
/// unless the run skips non-local checks.
#[must_use]
pub const fn requires_verification(is_local: bool, skip_non_local: bool) -> bool {
    is_local || !skip_non_local
}

/// Compute the base64 digest of the file at `path`.
///
/// # Errors
///
/// Returns [`IntegrityError::Io`] if the file cannot be read.
pub fn compute_digest(path: &Path, algorithm: HashAlgorithm) -> Result<String, IntegrityError> {
    let io_error = |source| IntegrityError::Io {
        path: path.to_owned(),
        source,
    };
    let mut file = File::open(path).map_err(io_error)?;
    algorithm.digest_reader(&mut file).map_err(io_error)
}

/// Verify the archive at `archive` against the descriptor in `plugin`.
///
/// # Errors
///
/// Returns [`IntegrityError`] when the descriptor is invalid, the archive
/// cannot be read, or the digests differ.
pub fn verify_archive(plugin: &PluginSpec, archive: &Path) -> Result<(), IntegrityError> {
    let descriptor = IntegrityDescriptor::for_plugin(plugin)?;
    let actual = compute_digest(archive, descriptor.algorithm())?;
    if actual != descriptor.digest() {
        return Err(IntegrityError::Mismatch {
            package: plugin.package.clone(),
            algorithm: descriptor.algorithm(),
            expected: descriptor.digest().to_owned(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::fs;

    fn plugin_with(integrity: Option<&str>) -> PluginSpec {
        PluginSpec {
            integrity: integrity.map(str::to_owned),
            ..PluginSpec::new("@scope/foo@1.0.0")
        }
    }

    fn digest_of(bytes: &[u8], algorithm: HashAlgorithm) -> String {
        algorithm
            .digest_reader(&mut &*bytes)
            .expect("in-memory read")
    }

    #[rstest]
    #[case::missing(None)]
    #[case::empty(Some(""))]
    #[case::no_separator(Some("sha512abc"))]
    #[case::too_many_parts(Some("sha-512-abc"))]
    #[case::empty_digest(Some("sha512-"))]
    fn malformed_descriptors_are_format_errors(#[case] integrity: Option<&str>) {
        let err = IntegrityDescriptor::for_plugin(&plugin_with(integrity))
            .expect_err("descriptor must be rejected");
        assert!(matches!(err, IntegrityError::Format { .. }), "got {err:?}");
        assert!(err.is_security_violation());
    }

    #[rstest]
    #[case::md5("md5-abc")]
    #[case::sha1("sha1-abc")]
    #[case::upper_case("SHA512-abc")]
    fn unknown_algorithms_are_rejected(#[case] value: &str) {
        let err = IntegrityDescriptor::parse("foo", value).expect_err("algorithm must be rejected");
        assert!(matches!(err, IntegrityError::UnsupportedAlgorithm { .. }));
    }

    #[rstest]
    #[case::sha256(HashAlgorithm::Sha256, "LPJNul+wow4m6DsqxbninhsWHlwfp0JecwQzYpOLmCQ=")]
    #[case::sha384(
        HashAlgorithm::Sha384,
        "WeF0h3dEjGnea4ANejO7+5/xtGPkQ1TDVTvNucZm+pASWjx5+QOXvfX2oT3oKGhP"
    )]
    #[case::sha512(
        HashAlgorithm::Sha512,
        "m3HSJL1i83hdltRq0+o9czGb+8KJDKra4t/3JRlnPKcjI8PZm6XBHXx6zG4UuMXaDEZjR1wuXDre9G9zvN7AQw=="
    )]
    fn digests_match_known_vectors(#[case] algorithm: HashAlgorithm, #[case] expected: &str) {
        assert_eq!(digest_of(b"hello", algorithm), expected);
    }

    #[test]
    fn verification_is_deterministic_and_detects_corruption() {
        let temp = tempfile::tempdir().expect("temp dir");
        let archive = temp.path().join("plugin.tgz");
        let mut bytes = b"pretend this is a gzip stream".to_vec();
        fs::write(&archive, &bytes).expect("write archive");

        let first = compute_digest(&archive, HashAlgorithm::Sha512).expect("digest");
        let second = compute_digest(&archive, HashAlgorithm::Sha512).expect("digest");
        assert_eq!(first, second);

        let plugin = plugin_with(Some(&format!("sha512-{first}")));
        verify_archive(&plugin, &archive).expect("unmodified archive verifies");

        if let Some(byte) = bytes.get_mut(3) {
            *byte ^= 0x01;
        }
        fs::write(&archive, &bytes).expect("rewrite archive");
        let err = verify_archive(&plugin, &archive).expect_err("corruption must be detected");
        assert!(matches!(
            err,
            IntegrityError::Mismatch { ref expected, ref actual, algorithm: HashAlgorithm::Sha512, .. }
                if *expected == first && *actual != first
        ));
    }

    #[test]
    fn unreadable_archive_is_not_a_security_violation() {
        let plugin = plugin_with(Some("sha256-abc="));
        let err = verify_archive(&plugin, Path::new("/nonexistent/archive.tgz"))
            .expect_err("missing archive must fail");
        assert!(matches!(err, IntegrityError::Io { .. }));
        assert!(!err.is_security_violation());
    }

    #[rstest]
    #[case::local_always(true, true, true)]
    #[case::local_default(true, false, true)]
    #[case::registry_default(false, false, true)]
    #[case::registry_skipped(false, true, false)]
    fn verification_requirement(#[case] local: bool, #[case] skip: bool, #[case] expected: bool) {
        assert_eq!(requires_verification(local, skip), expected);
    }
}
