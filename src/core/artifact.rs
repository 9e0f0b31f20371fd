//! Artifact format: archive layout, metadata schema, naming grammar.
//!
//! An artifact is a gzip-compressed tar with two top-level trees:
//!
//! ```text
//! meta/
//!   artifact.json           # Metadata
//!   <hook>.tengo            # optional hook scripts
//! data/
//!   <files...>              # payload; may be absent (meta-only artifact)
//! ```

use crate::core::platform::Platform;
use crate::io::archive::ArchiveError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use thiserror::Error;

/// Top-level metadata tree inside an artifact.
pub const META_DIR: &str = "meta";

/// Top-level payload tree inside an artifact.
pub const DATA_DIR: &str = "data";

/// Metadata file name inside `meta/`.
pub const METADATA_FILE: &str = "artifact.json";

/// Artifact archive extension.
pub const ARTIFACT_EXTENSION: &str = "gotya";

/// Hook script extension (scripts run by the embedded scripting engine).
pub const HOOK_EXTENSION: &str = "tengo";

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("invalid artifact name '{0}'")]
    InvalidName(String),

    #[error("invalid artifact version '{0}'")]
    InvalidVersion(String),

    #[error("artifact OS must not be empty")]
    EmptyOs,

    #[error("artifact architecture must not be empty")]
    EmptyArch,

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("artifact invalid: {0}")]
    Invalid(String),

    #[error("artifact not found at {0}")]
    NotFound(PathBuf),

    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("metadata error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// The closed set of hook identifiers an artifact may declare.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum HookName {
    #[serde(rename = "pre-install")]
    PreInstall,
    #[serde(rename = "post-install")]
    PostInstall,
    #[serde(rename = "pre-uninstall")]
    PreUninstall,
    #[serde(rename = "post-uninstall")]
    PostUninstall,
    #[serde(rename = "pre-update")]
    PreUpdate,
    #[serde(rename = "post-update")]
    PostUpdate,
}

impl HookName {
    /// All hook names, in lifecycle order.
    pub const ALL: [HookName; 6] = [
        HookName::PreInstall,
        HookName::PostInstall,
        HookName::PreUninstall,
        HookName::PostUninstall,
        HookName::PreUpdate,
        HookName::PostUpdate,
    ];

    /// The identifier as it appears in metadata.
    pub fn as_str(self) -> &'static str {
        match self {
            HookName::PreInstall => "pre-install",
            HookName::PostInstall => "post-install",
            HookName::PreUninstall => "pre-uninstall",
            HookName::PostUninstall => "post-uninstall",
            HookName::PreUpdate => "pre-update",
            HookName::PostUpdate => "post-update",
        }
    }
}

impl fmt::Display for HookName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A declared dependency on another artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    /// Name of the required artifact.
    pub name: String,
    /// Constraint on its version; empty means any.
    #[serde(default)]
    pub version_constraint: String,
}

/// The manifest embedded in every artifact at `meta/artifact.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub maintainer: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// `data/`-relative path (forward slashes) to hex SHA-256 digest,
    /// one entry per regular payload file.
    #[serde(default)]
    pub hashes: BTreeMap<String, String>,
    /// Hook name to script file inside `meta/`.
    #[serde(default)]
    pub hooks: BTreeMap<HookName, String>,
}

impl Metadata {
    /// Read and decode a metadata file.
    pub fn load(path: &Path) -> Result<Self, ArtifactError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Read and decode `meta/artifact.json` below `dir`.
    pub fn load_from_dir(dir: &Path) -> Result<Self, ArtifactError> {
        let path = dir.join(META_DIR).join(METADATA_FILE);
        let content = fs::read_to_string(&path).map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                ArtifactError::Invalid(format!("missing {META_DIR}/{METADATA_FILE}"))
            } else {
                ArtifactError::Io(e)
            }
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write canonical JSON (2-space indent, trailing newline) to `path`.
    pub fn write_to(&self, path: &Path) -> Result<(), ArtifactError> {
        let mut buf = serde_json::to_vec_pretty(self)?;
        buf.push(b'\n');
        fs::write(path, buf)?;
        Ok(())
    }

    /// The declared platform, with empty axes normalized to `any`.
    pub fn platform(&self) -> Platform {
        Platform::new(&self.os, &self.arch)
    }
}

/// Identity of one artifact: the unique `(name, version, os, arch)` tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactRef {
    pub name: String,
    pub version: String,
    pub os: String,
    pub arch: String,
}

impl ArtifactRef {
    /// Create a reference; empty platform axes normalize to `any`.
    pub fn new(name: &str, version: &str, os: &str, arch: &str) -> Self {
        let platform = Platform::new(os, arch);
        Self {
            name: name.to_string(),
            version: version.to_string(),
            os: platform.os,
            arch: platform.arch,
        }
    }

    /// The declared platform.
    pub fn platform(&self) -> Platform {
        Platform::new(&self.os, &self.arch)
    }

    /// Canonical archive file name: `<name>_<version>_<os>_<arch>.gotya`.
    pub fn filename(&self) -> String {
        format!(
            "{}_{}_{}_{}.{}",
            self.name, self.version, self.os, self.arch, ARTIFACT_EXTENSION
        )
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{} ({}/{})", self.name, self.version, self.os, self.arch)
    }
}

fn name_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new("^[A-Za-z0-9][A-Za-z0-9._-]*$").expect("static pattern")
    })
}

fn version_pattern() -> &'static regex::Regex {
    static PATTERN: OnceLock<regex::Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        regex::Regex::new("^[A-Za-z0-9][A-Za-z0-9.+_-]*$").expect("static pattern")
    })
}

/// Check an artifact name against the naming grammar.
pub fn validate_name(name: &str) -> Result<(), ArtifactError> {
    if name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(ArtifactError::InvalidName(name.to_string()))
    }
}

/// Check an artifact version against the version grammar.
pub fn validate_version(version: &str) -> Result<(), ArtifactError> {
    if version_pattern().is_match(version) {
        Ok(())
    } else {
        Err(ArtifactError::InvalidVersion(version.to_string()))
    }
}

/// Check that both platform axes are present.
pub fn validate_platform(os: &str, arch: &str) -> Result<(), ArtifactError> {
    if os.is_empty() {
        return Err(ArtifactError::EmptyOs);
    }
    if arch.is_empty() {
        return Err(ArtifactError::EmptyArch);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_grammar() {
        assert!(validate_name("jq").is_ok());
        assert!(validate_name("lib-2.0_x").is_ok());
        assert!(validate_name("0ad").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("-leading").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("sla/sh").is_err());
    }

    #[test]
    fn test_version_grammar() {
        assert!(validate_version("1.0.0").is_ok());
        assert!(validate_version("2024.01.01+build_7").is_ok());
        assert!(validate_version("").is_err());
        assert!(validate_version("+1.0").is_err());
        assert!(validate_version("1 0").is_err());
    }

    #[test]
    fn test_platform_validation() {
        assert!(validate_platform("linux", "amd64").is_ok());
        assert!(matches!(validate_platform("", "amd64"), Err(ArtifactError::EmptyOs)));
        assert!(matches!(validate_platform("linux", ""), Err(ArtifactError::EmptyArch)));
    }

    #[test]
    fn test_artifact_filename() {
        let r = ArtifactRef::new("h", "1.0.0", "linux", "amd64");
        assert_eq!(r.filename(), "h_1.0.0_linux_amd64.gotya");
    }

    #[test]
    fn test_hook_name_serde() {
        let json = serde_json::to_string(&HookName::PreInstall).unwrap();
        assert_eq!(json, "\"pre-install\"");

        let name: HookName = serde_json::from_str("\"post-update\"").unwrap();
        assert_eq!(name, HookName::PostUpdate);

        assert!(serde_json::from_str::<HookName>("\"mid-install\"").is_err());
    }

    #[test]
    fn test_metadata_canonical_form() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(METADATA_FILE);

        let mut meta = Metadata {
            name: "h".into(),
            version: "1.0.0".into(),
            os: "linux".into(),
            arch: "amd64".into(),
            maintainer: String::new(),
            description: String::new(),
            dependencies: vec![],
            hashes: BTreeMap::new(),
            hooks: BTreeMap::new(),
        };
        meta.hashes.insert("data/hello.txt".into(), "aa".into());

        meta.write_to(&path).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.ends_with('\n'));
        assert!(text.contains("  \"name\": \"h\""));

        let parsed: Metadata = serde_json::from_str(&text).unwrap();
        assert_eq!(parsed, meta);
    }

    #[test]
    fn test_metadata_hooks_roundtrip() {
        let mut meta = Metadata {
            name: "p".into(),
            version: "2.0.0".into(),
            os: "any".into(),
            arch: "any".into(),
            maintainer: "dev@example.com".into(),
            description: "test".into(),
            dependencies: vec![Dependency {
                name: "q".into(),
                version_constraint: ">= 1.0.0".into(),
            }],
            hashes: BTreeMap::new(),
            hooks: BTreeMap::new(),
        };
        meta.hooks.insert(HookName::PreInstall, "pre-install.tengo".into());

        let json = serde_json::to_string(&meta).unwrap();
        let parsed: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.hooks.get(&HookName::PreInstall).unwrap(), "pre-install.tengo");
        assert_eq!(parsed.dependencies[0].version_constraint, ">= 1.0.0");
    }
}
