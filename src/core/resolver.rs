//! Dependency resolver.
//!
//! Converts a set of resolve requests plus the installed database into an
//! ordered install plan: dependencies first, each artifact at most once,
//! every entry tagged install, update or skip.

use crate::core::constraint::{ConstraintError, VersionConstraint};
use crate::core::index::{IndexArtifactDescriptor, IndexStore};
use crate::core::platform::Platform;
use crate::store::db::InstalledDatabase;
use semver::Version;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("no resolve requests provided")]
    NoRequests,

    #[error("cannot resolve artifact '{name}' for {platform}")]
    Unresolved { name: String, platform: Platform },

    #[error("version conflict for '{name}': no version satisfies {}", format_sources(.constraints))]
    Conflict {
        name: String,
        constraints: Vec<ConstraintSource>,
    },

    #[error("dependency cycle detected: {}", .path.join(" -> "))]
    Cycle { path: Vec<String> },

    #[error("invalid constraint for '{name}': {source}")]
    Constraint {
        name: String,
        #[source]
        source: ConstraintError,
    },
}

/// One conjunct of a name's accumulated constraints, with provenance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConstraintSource {
    pub constraint: VersionConstraint,
    /// Who demanded it, e.g. `app@3.0.0` or `install request`.
    pub source: String,
}

impl fmt::Display for ConstraintSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' ({})", self.constraint, self.source)
    }
}

/// Reason recorded for plan entries the user asked for directly, as opposed
/// to entries pulled in as dependencies.
pub const REASON_USER_REQUEST: &str = "user request";

fn format_sources(sources: &[ConstraintSource]) -> String {
    sources
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A single resolver input.
///
/// A **primary** request (`keep_version == false`) asks for the artifact to
/// be present; an empty constraint means any version. A **keep** request
/// (`keep_version == true`) expresses "keep `old_version` if every hard
/// constraint allows it".
#[derive(Debug, Clone, Default)]
pub struct ResolveRequest {
    pub name: String,
    pub version_constraint: String,
    pub os: String,
    pub arch: String,
    pub old_version: String,
    pub keep_version: bool,
}

impl ResolveRequest {
    /// A primary request for `name` on `platform`.
    pub fn install(name: &str, version_constraint: &str, platform: &Platform) -> Self {
        Self {
            name: name.to_string(),
            version_constraint: version_constraint.to_string(),
            os: platform.os.clone(),
            arch: platform.arch.clone(),
            ..Self::default()
        }
    }

    /// A keep request for an installed `name@old_version`.
    pub fn keep(name: &str, old_version: &str, platform: &Platform) -> Self {
        Self {
            name: name.to_string(),
            old_version: old_version.to_string(),
            keep_version: true,
            os: platform.os.clone(),
            arch: platform.arch.clone(),
            ..Self::default()
        }
    }
}

/// What the executor must do for one plan entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactAction {
    Install,
    Update,
    Skip,
}

impl fmt::Display for ArtifactAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ArtifactAction::Install => "install",
            ArtifactAction::Update => "update",
            ArtifactAction::Skip => "skip",
        };
        f.write_str(s)
    }
}

/// One entry of the install plan.
#[derive(Debug, Clone)]
pub struct ResolvedArtifact {
    pub name: String,
    pub version: String,
    pub os: String,
    pub arch: String,
    pub url: String,
    pub checksum: String,
    pub action: ArtifactAction,
    pub reason: String,
}

impl ResolvedArtifact {
    /// Rebuild an index descriptor for the executor.
    pub fn to_descriptor(&self) -> IndexArtifactDescriptor {
        IndexArtifactDescriptor {
            name: self.name.clone(),
            version: self.version.clone(),
            description: String::new(),
            url: self.url.clone(),
            checksum: self.checksum.clone(),
            size: 0,
            os: self.os.clone(),
            arch: self.arch.clone(),
            dependencies: vec![],
        }
    }
}

/// The resolver output: topologically ordered, dependencies first.
#[derive(Debug, Clone, Default)]
pub struct InstallPlan {
    pub artifacts: Vec<ResolvedArtifact>,
}

impl InstallPlan {
    /// Look up a plan entry by artifact name.
    pub fn find(&self, name: &str) -> Option<&ResolvedArtifact> {
        self.artifacts.iter().find(|a| a.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }
}

/// Resolves requests against the index store and the installed database.
#[derive(Debug)]
pub struct Resolver<'a> {
    index: &'a IndexStore,
    db: &'a InstalledDatabase,
}

/// Shared resolution state; constraints accumulate across attempts.
struct State {
    constraints: BTreeMap<String, Vec<ConstraintSource>>,
    keeps: HashMap<String, String>,
    platforms: HashMap<String, Platform>,
    introduced_by: HashMap<String, String>,
    seeds: Vec<String>,
}

struct Selected {
    version: Version,
    descriptor: Option<IndexArtifactDescriptor>,
}

/// Per-attempt bookkeeping.
struct Attempt {
    selections: HashMap<String, Selected>,
    order: Vec<String>,
    visiting: Vec<String>,
    on_stack: HashSet<String>,
}

enum AttemptError {
    /// A new constraint invalidated an already-made selection; resolve
    /// again with the enlarged constraint table.
    Restart,
    Fatal(ResolveError),
}

impl From<ResolveError> for AttemptError {
    fn from(err: ResolveError) -> Self {
        AttemptError::Fatal(err)
    }
}

impl<'a> Resolver<'a> {
    pub fn new(index: &'a IndexStore, db: &'a InstalledDatabase) -> Self {
        Self { index, db }
    }

    /// Resolve `requests` into an ordered install plan.
    pub fn resolve(&self, requests: &[ResolveRequest]) -> Result<InstallPlan, ResolveError> {
        if requests.is_empty() {
            return Err(ResolveError::NoRequests);
        }

        let mut state = self.seed(requests)?;

        // Every restart strictly grows the constraint table, which is
        // bounded by the available (name, version) pairs, so this loop
        // terminates well before the cap.
        let max_attempts = 2 * self.index.descriptor_count() + 2 * requests.len() + 4;
        for _ in 0..max_attempts {
            match self.attempt(&mut state) {
                Ok(plan) => return Ok(plan),
                Err(AttemptError::Restart) => {}
                Err(AttemptError::Fatal(err)) => return Err(err),
            }
        }

        // Should be unreachable; report the most-contested name.
        let (name, constraints) = state
            .constraints
            .iter()
            .max_by_key(|(_, v)| v.len())
            .map(|(n, v)| (n.clone(), v.clone()))
            .unwrap_or_default();
        Err(ResolveError::Conflict { name, constraints })
    }

    fn seed(&self, requests: &[ResolveRequest]) -> Result<State, ResolveError> {
        let mut state = State {
            constraints: BTreeMap::new(),
            keeps: HashMap::new(),
            platforms: HashMap::new(),
            introduced_by: HashMap::new(),
            seeds: Vec::new(),
        };

        let (primaries, keeps): (Vec<_>, Vec<_>) =
            requests.iter().partition(|r| !r.keep_version);

        for request in primaries.into_iter().chain(keeps) {
            let platform = Platform::new(&request.os, &request.arch);
            state
                .platforms
                .entry(request.name.clone())
                .or_insert(platform);
            state
                .introduced_by
                .entry(request.name.clone())
                .or_insert_with(|| REASON_USER_REQUEST.to_string());

            if request.keep_version {
                state
                    .keeps
                    .insert(request.name.clone(), request.old_version.clone());
                // A hard constraint on a keep request is authoritative.
                if !request.version_constraint.is_empty() {
                    let constraint = parse_constraint(&request.name, &request.version_constraint)?;
                    push_constraint(
                        &mut state.constraints,
                        &request.name,
                        constraint,
                        "keep request",
                    );
                }
                state.constraints.entry(request.name.clone()).or_default();
            } else {
                let constraint = parse_constraint(&request.name, &request.version_constraint)?;
                push_constraint(
                    &mut state.constraints,
                    &request.name,
                    constraint,
                    "install request",
                );
            }

            if !state.seeds.contains(&request.name) {
                state.seeds.push(request.name.clone());
            }
        }

        Ok(state)
    }

    fn attempt(&self, state: &mut State) -> Result<InstallPlan, AttemptError> {
        let mut attempt = Attempt {
            selections: HashMap::new(),
            order: Vec::new(),
            visiting: Vec::new(),
            on_stack: HashSet::new(),
        };

        for seed in state.seeds.clone() {
            self.visit(&seed, state, &mut attempt)?;
        }

        Ok(self.emit(state, &attempt))
    }

    fn visit(
        &self,
        name: &str,
        state: &mut State,
        attempt: &mut Attempt,
    ) -> Result<(), AttemptError> {
        if attempt.on_stack.contains(name) {
            let start = attempt
                .visiting
                .iter()
                .position(|n| n == name)
                .unwrap_or(0);
            let mut path: Vec<String> = attempt.visiting[start..].to_vec();
            path.push(name.to_string());
            return Err(ResolveError::Cycle { path }.into());
        }
        if attempt.selections.contains_key(name) {
            return Ok(());
        }

        attempt.visiting.push(name.to_string());
        attempt.on_stack.insert(name.to_string());

        let selected = self.select(name, state)?;
        tracing::debug!("resolved {} @ {}", name, selected.version);

        let dependencies = selected
            .descriptor
            .as_ref()
            .map(|d| {
                let mut deps = d.dependencies.clone();
                deps.sort_by(|a, b| a.name.cmp(&b.name));
                deps
            })
            .unwrap_or_default();
        let source = format!("{}@{}", name, selected.version);
        attempt.selections.insert(name.to_string(), selected);

        for dependency in dependencies {
            let constraint = parse_constraint(&dependency.name, &dependency.version_constraint)?;
            let platform = state
                .platforms
                .get(name)
                .cloned()
                .unwrap_or_else(Platform::any);
            state
                .platforms
                .entry(dependency.name.clone())
                .or_insert(platform);
            state
                .introduced_by
                .entry(dependency.name.clone())
                .or_insert_with(|| format!("dependency of {source}"));

            let added = push_constraint(
                &mut state.constraints,
                &dependency.name,
                constraint.clone(),
                &source,
            );
            if added {
                if let Some(existing) = attempt.selections.get(&dependency.name) {
                    if !constraint.matches(&existing.version) {
                        tracing::debug!(
                            "new constraint '{}' on {} invalidates selected {}; restarting",
                            constraint,
                            dependency.name,
                            existing.version
                        );
                        return Err(AttemptError::Restart);
                    }
                }
            }

            self.visit(&dependency.name, state, attempt)?;
        }

        attempt.visiting.pop();
        attempt.on_stack.remove(name);
        attempt.order.push(name.to_string());
        Ok(())
    }

    /// Pick a version for `name` under its accumulated constraints,
    /// honoring a keep preference when the kept version still satisfies
    /// every conjunct.
    fn select(&self, name: &str, state: &State) -> Result<Selected, AttemptError> {
        let platform = state
            .platforms
            .get(name)
            .cloned()
            .unwrap_or_else(Platform::any);
        let conjunction = state.constraints.get(name).cloned().unwrap_or_default();
        let candidates = self.index.find_all(name, &platform);

        if let Some(old_version) = state.keeps.get(name) {
            if let Ok(version) = Version::parse(old_version) {
                if conjunction.iter().all(|c| c.constraint.matches(&version)) {
                    let descriptor = candidates
                        .iter()
                        .find(|d| d.version == *old_version)
                        .cloned();
                    return Ok(Selected {
                        version,
                        descriptor,
                    });
                }
            }
        }

        let best = candidates
            .into_iter()
            .filter_map(|d| d.semver().map(|v| (v, d)))
            .find(|(v, _)| conjunction.iter().all(|c| c.constraint.matches(v)));

        match best {
            Some((version, descriptor)) => Ok(Selected {
                version,
                descriptor: Some(descriptor),
            }),
            None => {
                if self.index.find_all(name, &platform).is_empty() {
                    Err(ResolveError::Unresolved {
                        name: name.to_string(),
                        platform,
                    }
                    .into())
                } else {
                    Err(ResolveError::Conflict {
                        name: name.to_string(),
                        constraints: conjunction,
                    }
                    .into())
                }
            }
        }
    }

    /// Emit plan entries in reverse post-order with actions assigned from
    /// the installed database.
    fn emit(&self, state: &State, attempt: &Attempt) -> InstallPlan {
        let mut artifacts = Vec::new();

        for name in &attempt.order {
            let Some(selected) = attempt.selections.get(name) else {
                continue;
            };
            let version = selected.version.to_string();
            let platform = state
                .platforms
                .get(name)
                .cloned()
                .unwrap_or_else(Platform::any);

            let installed = self.db.find(name).filter(|a| !a.is_missing());
            let (action, reason) = match installed {
                Some(record) if record.version == version => (
                    ArtifactAction::Skip,
                    "already at the required version".to_string(),
                ),
                Some(record) => (
                    ArtifactAction::Update,
                    format!("updating from {}", record.version),
                ),
                None => {
                    let reason = state
                        .introduced_by
                        .get(name)
                        .cloned()
                        .unwrap_or_else(|| REASON_USER_REQUEST.to_string());
                    (ArtifactAction::Install, reason)
                }
            };

            let (os, arch, url, checksum) = match &selected.descriptor {
                Some(d) => {
                    let p = d.platform();
                    (p.os, p.arch, d.url.clone(), d.checksum.clone())
                }
                None => (platform.os, platform.arch, String::new(), String::new()),
            };

            artifacts.push(ResolvedArtifact {
                name: name.clone(),
                version,
                os,
                arch,
                url,
                checksum,
                action,
                reason,
            });
        }

        InstallPlan { artifacts }
    }
}

fn parse_constraint(name: &str, text: &str) -> Result<VersionConstraint, ResolveError> {
    VersionConstraint::parse(text).map_err(|source| ResolveError::Constraint {
        name: name.to_string(),
        source,
    })
}

/// Record a constraint for `name` unless the identical (constraint, source)
/// pair is already present. Returns whether the table grew.
fn push_constraint(
    table: &mut BTreeMap<String, Vec<ConstraintSource>>,
    name: &str,
    constraint: VersionConstraint,
    source: &str,
) -> bool {
    let entry = table.entry(name.to_string()).or_default();
    let candidate = ConstraintSource {
        constraint,
        source: source.to_string(),
    };
    if entry.contains(&candidate) {
        return false;
    }
    entry.push(candidate);
    true
}
