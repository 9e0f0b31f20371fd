//! Repository index store.
//!
//! Each repository publishes a JSON array of artifact descriptors; the store
//! loads one index file per repository from the index cache directory and
//! answers platform- and constraint-filtered queries across all of them.

use crate::core::artifact::{ArtifactRef, Dependency};
use crate::core::constraint::{ConstraintError, VersionConstraint};
use crate::core::platform::Platform;
use semver::Version;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("index parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("constraint error: {0}")]
    Constraint(#[from] ConstraintError),
}

/// One artifact as advertised by a repository index.
///
/// Uniquely identified by `(name, version, os, arch)`; empty platform axes
/// mean `any`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexArtifactDescriptor {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Download location of the packed artifact.
    pub url: String,
    /// Hex SHA-256 of the packed archive file.
    #[serde(default)]
    pub checksum: String,
    /// Archive size in bytes.
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub os: String,
    #[serde(default)]
    pub arch: String,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

impl IndexArtifactDescriptor {
    /// The declared platform, empty axes normalized to `any`.
    pub fn platform(&self) -> Platform {
        Platform::new(&self.os, &self.arch)
    }

    /// The `(name, version, os, arch)` identity.
    pub fn artifact_ref(&self) -> ArtifactRef {
        ArtifactRef::new(&self.name, &self.version, &self.os, &self.arch)
    }

    /// Parsed semantic version, if the version string is well-formed.
    pub fn semver(&self) -> Option<Version> {
        Version::parse(&self.version).ok()
    }
}

/// A configured artifact repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub name: String,
    pub url: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Higher priority wins version ties across repositories.
    #[serde(default)]
    pub priority: i64,
}

fn default_enabled() -> bool {
    true
}

impl Repository {
    /// Location of this repository's cached index file.
    pub fn index_file(&self, index_dir: &Path) -> PathBuf {
        index_dir.join(format!("{}.json", self.name))
    }
}

#[derive(Debug)]
struct LoadedRepository {
    repository: Repository,
    descriptors: Vec<IndexArtifactDescriptor>,
}

/// All loaded repository indexes, queried as one.
#[derive(Debug, Default)]
pub struct IndexStore {
    repositories: Vec<LoadedRepository>,
}

impl IndexStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the index file of every enabled repository under `index_dir`.
    ///
    /// A repository without a cached index file contributes no candidates;
    /// a malformed index file is an error.
    pub fn open(index_dir: &Path, repositories: &[Repository]) -> Result<Self, IndexError> {
        let mut store = Self::new();
        for repository in repositories {
            if !repository.enabled {
                continue;
            }
            let path = repository.index_file(index_dir);
            let descriptors = if path.is_file() {
                let content = fs::read_to_string(&path)?;
                serde_json::from_str(&content)?
            } else {
                tracing::warn!(
                    "no cached index for repository '{}' at {}",
                    repository.name,
                    path.display()
                );
                Vec::new()
            };
            store.add_repository(repository.clone(), descriptors);
        }
        Ok(store)
    }

    /// Register a repository with its descriptors directly (no disk access).
    pub fn add_repository(
        &mut self,
        repository: Repository,
        descriptors: Vec<IndexArtifactDescriptor>,
    ) {
        if repository.enabled {
            self.repositories.push(LoadedRepository {
                repository,
                descriptors,
            });
        }
    }

    /// Total number of descriptors across all repositories.
    pub fn descriptor_count(&self) -> usize {
        self.repositories.iter().map(|r| r.descriptors.len()).sum()
    }

    /// Best candidate for `name` on `platform` under `constraint_text`.
    ///
    /// The constraint is parsed here so malformed input surfaces as
    /// `IndexError::Constraint` rather than an empty result.
    pub fn find_best(
        &self,
        name: &str,
        constraint_text: &str,
        platform: &Platform,
    ) -> Result<Option<IndexArtifactDescriptor>, IndexError> {
        let constraint = VersionConstraint::parse(constraint_text)?;
        Ok(self.find_best_matching(name, &constraint, platform))
    }

    /// Best candidate under an already-parsed constraint.
    ///
    /// Highest version wins; ties go to the higher-priority repository,
    /// then to repository registration order.
    pub fn find_best_matching(
        &self,
        name: &str,
        constraint: &VersionConstraint,
        platform: &Platform,
    ) -> Option<IndexArtifactDescriptor> {
        let mut best: Option<(Version, i64, usize, &IndexArtifactDescriptor)> = None;

        for (order, version, descriptor, priority) in self.candidates(name, platform) {
            if !constraint.matches(&version) {
                continue;
            }
            let better = match &best {
                None => true,
                Some((best_version, best_priority, best_order, _)) => {
                    version > *best_version
                        || (version == *best_version
                            && (priority > *best_priority
                                || (priority == *best_priority && order < *best_order)))
                }
            };
            if better {
                best = Some((version, priority, order, descriptor));
            }
        }

        best.map(|(_, _, _, descriptor)| descriptor.clone())
    }

    /// Every candidate for `name` on `platform`, highest version first.
    pub fn find_all(&self, name: &str, platform: &Platform) -> Vec<IndexArtifactDescriptor> {
        let mut matches: Vec<(Version, i64, usize, &IndexArtifactDescriptor)> =
            self.candidates(name, platform).map(|(order, version, d, priority)| {
                (version, priority, order, d)
            }).collect();

        matches.sort_by(|a, b| {
            b.0.cmp(&a.0)
                .then_with(|| b.1.cmp(&a.1))
                .then_with(|| a.2.cmp(&b.2))
        });
        matches.into_iter().map(|(_, _, _, d)| d.clone()).collect()
    }

    fn candidates<'a>(
        &'a self,
        name: &'a str,
        platform: &'a Platform,
    ) -> impl Iterator<Item = (usize, Version, &'a IndexArtifactDescriptor, i64)> + 'a {
        self.repositories
            .iter()
            .enumerate()
            .flat_map(move |(order, loaded)| {
                loaded
                    .descriptors
                    .iter()
                    .filter(move |d| d.name == name && d.platform().matches(platform))
                    .filter_map(move |d| {
                        let version = d.semver()?;
                        Some((order, version, d, loaded.repository.priority))
                    })
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn repo(name: &str, priority: i64) -> Repository {
        Repository {
            name: name.into(),
            url: format!("https://example.com/{name}"),
            enabled: true,
            priority,
        }
    }

    fn desc(name: &str, version: &str, os: &str, arch: &str) -> IndexArtifactDescriptor {
        IndexArtifactDescriptor {
            name: name.into(),
            version: version.into(),
            description: String::new(),
            url: format!("https://example.com/{name}_{version}.gotya"),
            checksum: String::new(),
            size: 0,
            os: os.into(),
            arch: arch.into(),
            dependencies: vec![],
        }
    }

    #[test]
    fn test_find_best_highest_version() {
        let mut store = IndexStore::new();
        store.add_repository(
            repo("main", 0),
            vec![
                desc("lib", "1.0.0", "linux", "amd64"),
                desc("lib", "2.0.0", "linux", "amd64"),
                desc("lib", "1.5.0", "linux", "amd64"),
            ],
        );

        let platform = Platform::new("linux", "amd64");
        let best = store.find_best("lib", "", &platform).unwrap().unwrap();
        assert_eq!(best.version, "2.0.0");
    }

    #[test]
    fn test_find_best_applies_constraint() {
        let mut store = IndexStore::new();
        store.add_repository(
            repo("main", 0),
            vec![
                desc("lib", "1.0.0", "linux", "amd64"),
                desc("lib", "2.0.0", "linux", "amd64"),
            ],
        );

        let platform = Platform::new("linux", "amd64");
        let best = store.find_best("lib", "< 2.0.0", &platform).unwrap().unwrap();
        assert_eq!(best.version, "1.0.0");

        assert!(store.find_best("lib", "> 9.0.0", &platform).unwrap().is_none());
    }

    #[test]
    fn test_find_best_platform_filter() {
        let mut store = IndexStore::new();
        store.add_repository(
            repo("main", 0),
            vec![
                desc("lib", "1.0.0", "linux", "amd64"),
                desc("lib", "3.0.0", "darwin", "arm64"),
                desc("lib", "2.0.0", "", ""),
            ],
        );

        let platform = Platform::new("linux", "amd64");
        // darwin 3.0.0 is filtered out; the any/any 2.0.0 descriptor wins.
        let best = store.find_best("lib", "", &platform).unwrap().unwrap();
        assert_eq!(best.version, "2.0.0");
    }

    #[test]
    fn test_priority_breaks_version_ties() {
        let mut low = desc("lib", "1.0.0", "any", "any");
        low.description = "from low".into();
        let mut high = desc("lib", "1.0.0", "any", "any");
        high.description = "from high".into();

        let mut store = IndexStore::new();
        store.add_repository(repo("low", 1), vec![low]);
        store.add_repository(repo("high", 9), vec![high]);

        // Same version in both; the higher-priority repo's copy is returned
        // even though it registered later.
        let best = store.find_best("lib", "", &Platform::any()).unwrap().unwrap();
        assert_eq!(best.description, "from high");

        let all = store.find_all("lib", &Platform::any());
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].description, "from high");
    }

    #[test]
    fn test_repository_order_breaks_remaining_ties() {
        let mut first = desc("lib", "1.0.0", "any", "any");
        first.description = "first".into();
        let mut second = desc("lib", "1.0.0", "any", "any");
        second.description = "second".into();

        let mut store = IndexStore::new();
        store.add_repository(repo("a", 0), vec![first]);
        store.add_repository(repo("b", 0), vec![second]);

        let best = store.find_best("lib", "", &Platform::any()).unwrap().unwrap();
        assert_eq!(best.description, "first");
    }

    #[test]
    fn test_constraint_parse_failure_is_an_error() {
        let mut store = IndexStore::new();
        store.add_repository(repo("main", 0), vec![desc("lib", "1.0.0", "any", "any")]);

        let err = store.find_best("lib", ">= banana", &Platform::any()).unwrap_err();
        assert!(matches!(err, IndexError::Constraint(_)));
    }

    #[test]
    fn test_find_all_sorted_descending() {
        let mut store = IndexStore::new();
        store.add_repository(
            repo("main", 0),
            vec![
                desc("lib", "1.0.0", "any", "any"),
                desc("lib", "3.0.0", "any", "any"),
                desc("lib", "2.0.0", "any", "any"),
            ],
        );

        let versions: Vec<String> = store
            .find_all("lib", &Platform::any())
            .into_iter()
            .map(|d| d.version)
            .collect();
        assert_eq!(versions, vec!["3.0.0", "2.0.0", "1.0.0"]);
    }

    #[test]
    fn test_disabled_repository_is_ignored() {
        let mut disabled = repo("off", 0);
        disabled.enabled = false;

        let mut store = IndexStore::new();
        store.add_repository(disabled, vec![desc("lib", "1.0.0", "any", "any")]);

        assert!(store.find_best("lib", "", &Platform::any()).unwrap().is_none());
    }

    #[test]
    fn test_open_from_disk() {
        let dir = tempdir().unwrap();
        let repos = vec![repo("main", 0), repo("extra", 0)];

        let index = vec![desc("tool", "1.0.0", "linux", "amd64")];
        fs::write(
            dir.path().join("main.json"),
            serde_json::to_string(&index).unwrap(),
        )
        .unwrap();
        // "extra" has no cached index file: contributes nothing.

        let store = IndexStore::open(dir.path(), &repos).unwrap();
        assert_eq!(store.descriptor_count(), 1);

        let best = store
            .find_best("tool", "", &Platform::new("linux", "amd64"))
            .unwrap()
            .unwrap();
        assert_eq!(best.version, "1.0.0");
    }

    #[test]
    fn test_open_malformed_index_fails() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("main.json"), "{not json").unwrap();

        let err = IndexStore::open(dir.path(), &[repo("main", 0)]).unwrap_err();
        assert!(matches!(err, IndexError::Json(_)));
    }
}
