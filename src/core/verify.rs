//! Content-addressed artifact verification.
//!
//! Every regular file under `data/` must hash to the digest recorded in
//! `meta/artifact.json`, and every recorded digest must have its file on
//! disk. A missing `data/` tree is legal (meta-only artifact).

use crate::core::artifact::{ArtifactError, ArtifactRef, DATA_DIR, Metadata};
use crate::io::archive;
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::Path;
use walkdir::WalkDir;

/// Verify a packed artifact file.
///
/// The archive is extracted to a temporary directory (removed on return)
/// and checked with [`verify_from_directory`]. Fails with `NotFound` when
/// the file is absent and `UnsupportedFormat` for unrecognized extensions.
pub fn verify_file(
    archive_path: &Path,
    expected: Option<&ArtifactRef>,
) -> Result<Metadata, ArtifactError> {
    if !archive_path.is_file() {
        return Err(ArtifactError::NotFound(archive_path.to_path_buf()));
    }
    archive::ensure_supported(archive_path)?;

    let staging = tempfile::tempdir()?;
    archive::extract(archive_path, staging.path())?;
    verify_from_directory(staging.path(), expected)
}

/// Verify an extracted artifact tree rooted at `dir`.
///
/// When `expected` is given, the decoded metadata must carry the same name,
/// version and (`any`-normalized) platform; any mismatch is
/// `ArtifactError::Invalid`.
pub fn verify_from_directory(
    dir: &Path,
    expected: Option<&ArtifactRef>,
) -> Result<Metadata, ArtifactError> {
    let metadata = Metadata::load_from_dir(dir)?;

    if let Some(expected) = expected {
        check_descriptor(&metadata, expected)?;
    }

    let data_dir = dir.join(DATA_DIR);
    let mut seen = BTreeSet::new();

    if data_dir.is_dir() {
        for entry in WalkDir::new(&data_dir).min_depth(1) {
            let entry = entry.map_err(io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(dir)
                .map_err(io::Error::other)?;
            let key = archive::slash_name(rel);
            let digest = sha256_file(entry.path())?;

            match metadata.hashes.get(&key) {
                Some(want) if want.eq_ignore_ascii_case(&digest) => {
                    seen.insert(key);
                }
                Some(want) => {
                    return Err(ArtifactError::Invalid(format!(
                        "hash mismatch for {key}: expected {want}, got {digest}"
                    )));
                }
                None => {
                    return Err(ArtifactError::Invalid(format!(
                        "file {key} is not listed in the metadata hashes"
                    )));
                }
            }
        }
    }

    for key in metadata.hashes.keys() {
        if !seen.contains(key) {
            return Err(ArtifactError::Invalid(format!(
                "hashed file {key} is missing on disk"
            )));
        }
    }

    Ok(metadata)
}

/// Hex SHA-256 digest of a file's contents.
pub fn sha256_file(path: &Path) -> Result<String, ArtifactError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

fn check_descriptor(metadata: &Metadata, expected: &ArtifactRef) -> Result<(), ArtifactError> {
    if metadata.name != expected.name {
        return Err(ArtifactError::Invalid(format!(
            "name mismatch: archive says '{}', expected '{}'",
            metadata.name, expected.name
        )));
    }
    if metadata.version != expected.version {
        return Err(ArtifactError::Invalid(format!(
            "version mismatch: archive says '{}', expected '{}'",
            metadata.version, expected.version
        )));
    }
    if metadata.platform() != expected.platform() {
        return Err(ArtifactError::Invalid(format!(
            "platform mismatch: archive says {}, expected {}",
            metadata.platform(),
            expected.platform()
        )));
    }
    Ok(())
}
