use std::io::Read;
use std::path::Path;

use log::{debug, warn};
use semver::Version;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::record::Manifest;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },
    #[error("bundle requires app version {required}, running {current}")]
    IncompatibleVersion { required: String, current: String },
    #[error("{context}: {source}")]
    Read {
        context: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Proof that a payload matched its declared digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verified {
    pub checksum: String,
    pub size: u64,
}

/// Incremental SHA-256 over a payload written in chunks.
#[derive(Default, Clone)]
pub struct StreamingDigest {
    hasher: Sha256,
    size: u64,
}

impl StreamingDigest {
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.size += chunk.len() as u64;
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn finish(self) -> (String, u64) {
        (format!("{:x}", self.hasher.finalize()), self.size)
    }
}

#[derive(Debug, Clone)]
pub struct IntegrityVerifier {
    app_version: String,
}

impl IntegrityVerifier {
    /// A verifier for a host running `app_version`, which `minAppVersion`
    /// is checked against.
    #[must_use]
    pub fn new(app_version: impl Into<String>) -> Self {
        Self {
            app_version: app_version.into(),
        }
    }

    /// Reject a manifest whose `minAppVersion` is newer than the running app.
    ///
    /// # Errors
    /// Returns [`VerifyError::IncompatibleVersion`] when the host is too old or
    /// the requirement cannot be parsed.
    pub fn check_compatibility(&self, manifest: &Manifest) -> Result<(), VerifyError> {
        let Some(required) = &manifest.min_app_version else {
            return Ok(());
        };
        let current = &self.app_version;

        if is_version_at_least(current, required) {
            Ok(())
        } else {
            warn!(
                "Bundle {} requires app {required}, running {current}",
                manifest.id
            );
            Err(VerifyError::IncompatibleVersion {
                required: required.clone(),
                current: current.clone(),
            })
        }
    }

    /// Hash the whole of `reader` and compare against `expected`.
    ///
    /// Empty payloads never verify.
    ///
    /// # Errors
    /// Returns [`VerifyError::ChecksumMismatch`] when the digest differs or the
    /// payload is empty, and [`VerifyError::Read`] when reading fails.
    pub fn verify<R: Read>(&self, mut reader: R, expected: &str) -> Result<Verified, VerifyError> {
        let mut digest = StreamingDigest::default();
        let mut buffer = [0_u8; 8192];

        loop {
            let read = reader.read(&mut buffer).map_err(|source| VerifyError::Read {
                context: "failed to read payload for checksum",
                source,
            })?;
            if read == 0 {
                break;
            }
            digest.update(&buffer[..read]);
        }

        let (actual, size) = digest.finish();
        compare(expected, actual, size)
    }

    /// # Errors
    /// See [`IntegrityVerifier::verify`]; opening the file maps to
    /// [`VerifyError::Read`].
    pub fn verify_file(&self, path: &Path, expected: &str) -> Result<Verified, VerifyError> {
        let file = std::fs::File::open(path).map_err(|source| VerifyError::Read {
            context: "failed to open payload for checksum",
            source,
        })?;
        self.verify(std::io::BufReader::new(file), expected)
    }
}

fn compare(expected: &str, actual: String, size: u64) -> Result<Verified, VerifyError> {
    let mismatch = |actual: String| VerifyError::ChecksumMismatch {
        expected: expected.to_ascii_lowercase(),
        actual,
    };

    if size == 0 {
        return Err(mismatch(actual));
    }
    let Some(expected) = parse_expected_checksum(expected) else {
        return Err(mismatch(actual));
    };
    if actual != expected {
        return Err(mismatch(actual));
    }

    debug!("Payload verified ({size} bytes, sha256 {actual})");
    Ok(Verified {
        checksum: actual,
        size,
    })
}

/// Normalize a declared digest: bare hex or `sha256:<hex>`.
pub(crate) fn parse_expected_checksum(digest: &str) -> Option<String> {
    let digest = digest.trim();
    let hash = match digest.split_once(':') {
        Some((algorithm, hash)) if algorithm.eq_ignore_ascii_case("sha256") => hash,
        Some(_) => return None,
        None => digest,
    };
    if hash.len() != 64 || !hash.chars().all(|ch| ch.is_ascii_hexdigit()) {
        return None;
    }
    Some(hash.to_ascii_lowercase())
}

/// `current >= required`, comparing leniently parsed semver.
///
/// Unparseable versions never satisfy a requirement.
#[must_use]
pub fn is_version_at_least(current: &str, required: &str) -> bool {
    match (parse_semver(current), parse_semver(required)) {
        (Some(current), Some(required)) => current >= required,
        _ => false,
    }
}

fn parse_semver(version: &str) -> Option<Version> {
    let version = version.trim();
    let version = version.strip_prefix('v').unwrap_or(version);
    if let Ok(parsed) = Version::parse(version) {
        return Some(parsed);
    }

    let suffix_idx = version.find(['-', '+']).unwrap_or(version.len());
    let (core, suffix) = (&version[..suffix_idx], &version[suffix_idx..]);
    let mut parts = core.split('.');
    let major = parts.next()?.parse::<u64>().ok()?;
    let minor = parts.next().map(str::parse::<u64>).transpose().ok()?;
    let patch = parts.next().map(str::parse::<u64>).transpose().ok()?;

    if parts.next().is_some() {
        return None;
    }

    let normalized = match (minor, patch) {
        (None, _) => format!("{major}.0.0{suffix}"),
        (Some(minor), None) => format!("{major}.{minor}.0{suffix}"),
        (Some(minor), Some(patch)) => format!("{major}.{minor}.{patch}{suffix}"),
    };

    Version::parse(&normalized).ok()
}
