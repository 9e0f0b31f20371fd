//! Artifact packing.
//!
//! Validates an input tree, stages it with streaming SHA-256 of the payload,
//! writes the canonical metadata manifest, archives the result and
//! self-verifies before handing the `.gotya` file back.

use crate::core::artifact::{
    self, ArtifactError, ArtifactRef, DATA_DIR, Dependency, HOOK_EXTENSION, META_DIR,
    METADATA_FILE, Metadata,
};
use crate::core::verify;
use crate::io::archive;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Everything needed to pack one artifact.
#[derive(Debug, Clone)]
pub struct PackRequest {
    pub name: String,
    pub version: String,
    pub os: String,
    pub arch: String,
    pub maintainer: String,
    pub description: String,
    pub dependencies: Vec<Dependency>,
    /// Hook name to script file name inside `meta/`.
    pub hooks: BTreeMap<artifact::HookName, String>,
    /// Tree to pack; its top level must be a subset of `{meta/, data/}`.
    pub input_dir: PathBuf,
    /// Directory receiving `<name>_<version>_<os>_<arch>.gotya`.
    pub output_dir: PathBuf,
}

/// Pack an artifact, returning the path of the written archive.
pub fn pack(request: &PackRequest) -> Result<PathBuf, ArtifactError> {
    artifact::validate_name(&request.name)?;
    artifact::validate_version(&request.version)?;
    artifact::validate_platform(&request.os, &request.arch)?;

    if !request.input_dir.is_dir() {
        return Err(ArtifactError::Validation(format!(
            "input directory {} does not exist",
            request.input_dir.display()
        )));
    }
    validate_layout(&request.input_dir, &request.hooks)?;

    let staging = tempfile::tempdir()?;
    let hashes = stage_copy(&request.input_dir, staging.path())?;

    let metadata = Metadata {
        name: request.name.clone(),
        version: request.version.clone(),
        os: request.os.clone(),
        arch: request.arch.clone(),
        maintainer: request.maintainer.clone(),
        description: request.description.clone(),
        dependencies: request.dependencies.clone(),
        hashes,
        hooks: request.hooks.clone(),
    };

    let meta_dir = staging.path().join(META_DIR);
    fs::create_dir_all(&meta_dir)?;
    metadata.write_to(&meta_dir.join(METADATA_FILE))?;

    let reference = ArtifactRef::new(&request.name, &request.version, &request.os, &request.arch);
    fs::create_dir_all(&request.output_dir)?;
    let output_path = request.output_dir.join(reference.filename());
    archive::create(staging.path(), &output_path)?;

    // Self-check: the staging tree must verify against what we just wrote.
    if let Err(err) = verify::verify_from_directory(staging.path(), Some(&reference)) {
        let _ = fs::remove_file(&output_path);
        return Err(err);
    }

    tracing::debug!("packed {} -> {}", reference, output_path.display());
    Ok(output_path)
}

/// Top level must be a subset of `{meta, data}`; `meta/` may only hold the
/// manifest and hook scripts that are declared in `hooks`.
fn validate_layout(
    input_dir: &Path,
    hooks: &BTreeMap<artifact::HookName, String>,
) -> Result<(), ArtifactError> {
    for entry in fs::read_dir(input_dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name != META_DIR && name != DATA_DIR {
            return Err(ArtifactError::Validation(format!(
                "unexpected top-level entry '{name}': only '{META_DIR}/' and '{DATA_DIR}/' are allowed"
            )));
        }
        if !entry.file_type()?.is_dir() {
            return Err(ArtifactError::Validation(format!(
                "top-level entry '{name}' must be a directory"
            )));
        }
    }

    let meta_dir = input_dir.join(META_DIR);
    if meta_dir.is_dir() {
        for entry in fs::read_dir(&meta_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            if entry.file_type()?.is_dir() {
                return Err(ArtifactError::Validation(format!(
                    "'{META_DIR}/{name}' is a directory; '{META_DIR}/' may only contain files"
                )));
            }
            if name == METADATA_FILE {
                continue;
            }
            if !name.ends_with(&format!(".{HOOK_EXTENSION}")) {
                return Err(ArtifactError::Validation(format!(
                    "'{META_DIR}/{name}' is neither the manifest nor a .{HOOK_EXTENSION} script"
                )));
            }
            if !hooks.values().any(|script| script == &name) {
                return Err(ArtifactError::Validation(format!(
                    "hook script '{META_DIR}/{name}' is not referenced by any declared hook"
                )));
            }
        }
    }

    // Every declared hook must have its script on disk.
    for (hook, script) in hooks {
        if !script.ends_with(&format!(".{HOOK_EXTENSION}")) {
            return Err(ArtifactError::Validation(format!(
                "hook '{hook}' references '{script}', which is not a .{HOOK_EXTENSION} script"
            )));
        }
        if !meta_dir.join(script).is_file() {
            return Err(ArtifactError::Validation(format!(
                "hook '{hook}' references missing script '{META_DIR}/{script}'"
            )));
        }
    }

    Ok(())
}

/// Copy the input tree into staging, hashing `data/` files on the way.
fn stage_copy(
    input_dir: &Path,
    staging: &Path,
) -> Result<BTreeMap<String, String>, ArtifactError> {
    let mut hashes = BTreeMap::new();

    for entry in WalkDir::new(input_dir).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        let rel = entry
            .path()
            .strip_prefix(input_dir)
            .map_err(std::io::Error::other)?;
        let dest = staging.join(rel);

        let file_type = entry.file_type();
        if file_type.is_dir() {
            fs::create_dir_all(&dest)?;
        } else if file_type.is_file() {
            let digest = copy_hashing(entry.path(), &dest)?;
            let key = archive::slash_name(rel);
            if key.starts_with("data/") {
                hashes.insert(key, digest);
            }
        } else if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            // Absolute targets and targets escaping the input tree are
            // rejected; the check also covers links inside data/ that a
            // later extraction would refuse.
            archive::check_link_target(rel, &target)?;
            make_symlink(&target, &dest)?;
        } else {
            return Err(ArtifactError::Archive(
                archive::ArchiveError::UnsupportedFileType {
                    path: rel.to_path_buf(),
                    kind: format!("{file_type:?}"),
                },
            ));
        }
    }

    Ok(hashes)
}

/// Copy a regular file while streaming it through SHA-256.
fn copy_hashing(src: &Path, dest: &Path) -> Result<String, ArtifactError> {
    let mut reader = File::open(src)?;
    let mut writer = File::create(dest)?;
    let mut hasher = Sha256::new();

    let mut buf = [0u8; 32 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        writer.write_all(&buf[..n])?;
    }
    writer.flush()?;

    let perms = fs::metadata(src)?.permissions();
    fs::set_permissions(dest, perms)?;

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(unix)]
fn make_symlink(target: &Path, dest: &Path) -> std::io::Result<()> {
    std::os::unix::fs::symlink(target, dest)
}

#[cfg(windows)]
fn make_symlink(target: &Path, dest: &Path) -> std::io::Result<()> {
    std::os::windows::fs::symlink_file(target, dest)
}
