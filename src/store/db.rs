//! Installed-artifacts database.
//!
//! A JSON file holding one record per installed artifact, written atomically
//! (sibling temp file, fsync, rename). Reverse-dependency edges are kept
//! bidirectional: whenever `A` depends on `B`, `B.reverse_dependencies`
//! lists `A`, with a `missing` placeholder standing in for dependencies that
//! are not installed yet.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// Current on-disk schema version.
pub const DB_FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("database path must be absolute: {0}")]
    RelativePath(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("database parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("artifact not installed: {0}")]
    ArtifactNotFound(String),
}

/// Whether a record describes a real installation or a placeholder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactStatus {
    #[default]
    Installed,
    /// Placeholder inserted for a declared dependency that is not yet
    /// installed; replaced by a real record when it arrives.
    Missing,
}

/// Why an artifact is on this machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InstallationReason {
    #[serde(rename = "manual")]
    Manual,
    #[serde(rename = "automatic")]
    Automatic,
    #[default]
    #[serde(rename = "")]
    Unspecified,
}

/// One installed file with its recorded digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledFile {
    /// Path relative to the artifact's meta or data directory.
    pub path: String,
    /// Hex SHA-256 of the file at install time.
    pub hash: String,
}

/// One record of the installed database; unique per `name`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct InstalledArtifact {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub installed_at: String,
    /// URL the artifact was fetched from.
    #[serde(default)]
    pub installed_from: String,
    #[serde(default)]
    pub artifact_meta_dir: String,
    #[serde(default)]
    pub artifact_data_dir: String,
    #[serde(default)]
    pub meta_files: Vec<InstalledFile>,
    #[serde(default)]
    pub data_files: Vec<InstalledFile>,
    /// Names of installed artifacts that depend on this one.
    #[serde(default)]
    pub reverse_dependencies: Vec<String>,
    #[serde(default)]
    pub status: ArtifactStatus,
    /// Hex SHA-256 of the packed archive this was installed from.
    #[serde(default)]
    pub checksum: String,
    #[serde(default)]
    pub installation_reason: InstallationReason,
}

impl InstalledArtifact {
    /// Placeholder for a dependency that is referenced but not installed.
    pub fn missing_placeholder(name: &str, dependent: &str) -> Self {
        Self {
            name: name.to_string(),
            status: ArtifactStatus::Missing,
            reverse_dependencies: vec![dependent.to_string()],
            ..Self::default()
        }
    }

    /// Whether this record is a placeholder.
    pub fn is_missing(&self) -> bool {
        self.status == ArtifactStatus::Missing
    }

    /// Record `dependent` as depending on this artifact.
    pub fn add_reverse_dependency(&mut self, dependent: &str) {
        if !self.reverse_dependencies.iter().any(|d| d == dependent) {
            self.reverse_dependencies.push(dependent.to_string());
            self.reverse_dependencies.sort();
        }
    }

    /// Drop `dependent` from the reverse-dependency list.
    pub fn remove_reverse_dependency(&mut self, dependent: &str) {
        self.reverse_dependencies.retain(|d| d != dependent);
    }
}

/// The installed-artifacts database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledDatabase {
    pub format_version: u32,
    #[serde(default)]
    pub last_update: String,
    #[serde(default)]
    pub artifacts: Vec<InstalledArtifact>,
}

impl Default for InstalledDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl InstalledDatabase {
    /// An empty database.
    pub fn new() -> Self {
        Self {
            format_version: DB_FORMAT_VERSION,
            last_update: String::new(),
            artifacts: Vec::new(),
        }
    }

    /// Load from `path`. A missing file is an empty database; malformed
    /// JSON is an error. The path must be absolute.
    pub fn load_from(path: &Path) -> Result<Self, DbError> {
        validate_path(path)?;
        if !path.exists() {
            return Ok(Self::new());
        }
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Write atomically: a sibling temp file is written and fsynced, then
    /// renamed over the target. The temp file is removed on any failure
    /// between open and rename.
    pub fn save_to(&self, path: &Path) -> Result<(), DbError> {
        validate_path(path)?;
        let dir = path
            .parent()
            .ok_or_else(|| DbError::RelativePath(path.to_path_buf()))?;
        fs::create_dir_all(dir)?;

        // NamedTempFile removes itself on drop, covering every early
        // return below; persist() is the atomic rename.
        let mut tmp = NamedTempFile::new_in(dir)?;
        serde_json::to_writer_pretty(&mut tmp, self)?;
        io::Write::write_all(&mut tmp, b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| DbError::Io(e.error))?;

        tracing::debug!("saved installed database to {}", path.display());
        Ok(())
    }

    /// Look up a record by name.
    pub fn find(&self, name: &str) -> Option<&InstalledArtifact> {
        self.artifacts.iter().find(|a| a.name == name)
    }

    pub(crate) fn find_mut(&mut self, name: &str) -> Option<&mut InstalledArtifact> {
        self.artifacts.iter_mut().find(|a| a.name == name)
    }

    /// Whether a non-placeholder record exists for `name`.
    pub fn is_installed(&self, name: &str) -> bool {
        self.find(name).is_some_and(|a| !a.is_missing())
    }

    /// Insert a record, replacing any record of the same name. A replaced
    /// record's reverse-dependency edges carry over, so placeholders keep
    /// their dependents when the real artifact arrives.
    pub fn add(&mut self, mut artifact: InstalledArtifact) {
        if let Some(existing) = self.find(&artifact.name) {
            for dependent in existing.reverse_dependencies.clone() {
                artifact.add_reverse_dependency(&dependent);
            }
            self.artifacts.retain(|a| a.name != artifact.name);
        }
        self.artifacts.push(artifact);
        self.touch();
    }

    /// Remove a record and strip its name from every other record's
    /// reverse-dependency list, keeping the edge set bidirectional.
    pub fn remove(&mut self, name: &str) -> Option<InstalledArtifact> {
        let position = self.artifacts.iter().position(|a| a.name == name)?;
        let removed = self.artifacts.remove(position);
        for artifact in &mut self.artifacts {
            artifact.remove_reverse_dependency(name);
        }
        self.touch();
        Some(removed)
    }

    /// Snapshot copies of every record.
    pub fn all(&self) -> Vec<InstalledArtifact> {
        self.artifacts.clone()
    }

    /// Records whose name contains `pattern`, case-insensitively.
    pub fn filter(&self, pattern: &str) -> Vec<InstalledArtifact> {
        let needle = pattern.to_lowercase();
        self.artifacts
            .iter()
            .filter(|a| a.name.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    /// Flip the installation reason of an installed artifact.
    pub fn set_installation_reason(
        &mut self,
        name: &str,
        reason: InstallationReason,
    ) -> Result<(), DbError> {
        let artifact = self
            .find_mut(name)
            .ok_or_else(|| DbError::ArtifactNotFound(name.to_string()))?;
        artifact.installation_reason = reason;
        self.touch();
        Ok(())
    }

    /// Bump `last_update`, keeping it strictly increasing even when two
    /// mutations land inside one clock tick.
    fn touch(&mut self) {
        let mut now = Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true);
        if now <= self.last_update {
            if let Ok(previous) = DateTime::parse_from_rfc3339(&self.last_update) {
                now = (previous + Duration::microseconds(1))
                    .with_timezone(&Utc)
                    .to_rfc3339_opts(SecondsFormat::Micros, true);
            }
        }
        self.last_update = now;
    }
}

fn validate_path(path: &Path) -> Result<(), DbError> {
    if path.is_absolute() {
        Ok(())
    } else {
        Err(DbError::RelativePath(path.to_path_buf()))
    }
}
