//! Version constraint grammar.
//!
//! Supports the operators `=`, `!=`, `<`, `<=`, `>`, `>=`, `~>` with
//! comma-separated conjunction, e.g. `>= 1.2.0, < 2.0.0`. A bare version
//! means `=`; the empty string matches any version. Partial versions are
//! allowed: `= 1.2` prefix-matches every `1.2.x`.

use semver::{Prerelease, Version};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConstraintError {
    #[error("invalid version constraint '{0}'")]
    InvalidConstraint(String),

    #[error("invalid version '{0}' in constraint")]
    InvalidVersion(String),
}

/// Comparison operator of a single conjunct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    /// `~>`: at least the given version, below the next significant release.
    Pessimistic,
}

/// A possibly partial version pattern (`1`, `1.2`, `1.2.3`, `1.2.3-rc.1`).
#[derive(Debug, Clone, PartialEq, Eq)]
struct Pattern {
    major: u64,
    minor: Option<u64>,
    patch: Option<u64>,
    pre: Prerelease,
}

impl Pattern {
    fn parse(text: &str) -> Result<Self, ConstraintError> {
        let invalid = || ConstraintError::InvalidVersion(text.to_string());

        let segments: Vec<&str> = text.splitn(3, '.').collect();
        match segments.len() {
            1 => Ok(Self {
                major: segments[0].parse().map_err(|_| invalid())?,
                minor: None,
                patch: None,
                pre: Prerelease::EMPTY,
            }),
            2 => Ok(Self {
                major: segments[0].parse().map_err(|_| invalid())?,
                minor: Some(segments[1].parse().map_err(|_| invalid())?),
                patch: None,
                pre: Prerelease::EMPTY,
            }),
            _ => {
                // Full version: let semver handle pre-release and build tags.
                let version = Version::parse(text).map_err(|_| invalid())?;
                Ok(Self {
                    major: version.major,
                    minor: Some(version.minor),
                    patch: Some(version.patch),
                    pre: version.pre,
                })
            }
        }
    }

    /// The lowest concrete version the pattern denotes.
    fn floor(&self) -> Version {
        let mut v = Version::new(self.major, self.minor.unwrap_or(0), self.patch.unwrap_or(0));
        v.pre = self.pre.clone();
        v
    }

    /// Prefix equality on the specified segments.
    fn matches_prefix(&self, v: &Version) -> bool {
        v.major == self.major
            && self.minor.is_none_or(|m| v.minor == m)
            && self.patch.is_none_or(|p| v.patch == p)
            && (self.patch.is_none() || v.pre == self.pre)
    }

    /// Exclusive upper bound for `~>`: bump the second-to-last given segment.
    fn pessimistic_ceiling(&self) -> Version {
        match (self.minor, self.patch) {
            (Some(minor), Some(_)) => Version::new(self.major, minor + 1, 0),
            _ => Version::new(self.major + 1, 0, 0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Comparator {
    op: Op,
    pattern: Pattern,
}

impl Comparator {
    fn matches(&self, v: &Version) -> bool {
        match self.op {
            Op::Eq => self.pattern.matches_prefix(v),
            Op::Ne => !self.pattern.matches_prefix(v),
            Op::Lt => *v < self.pattern.floor(),
            Op::Le => *v <= self.pattern.floor(),
            Op::Gt => *v > self.pattern.floor(),
            Op::Ge => *v >= self.pattern.floor(),
            Op::Pessimistic => {
                *v >= self.pattern.floor() && *v < self.pattern.pessimistic_ceiling()
            }
        }
    }
}

/// A parsed version constraint: the conjunction of its comparators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionConstraint {
    raw: String,
    comparators: Vec<Comparator>,
}

impl VersionConstraint {
    /// The constraint matching every version.
    pub fn any() -> Self {
        Self {
            raw: String::new(),
            comparators: Vec::new(),
        }
    }

    /// Parse a constraint string. The empty string matches any version.
    pub fn parse(text: &str) -> Result<Self, ConstraintError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(Self::any());
        }

        let mut comparators = Vec::new();
        for part in trimmed.split(',') {
            let part = part.trim();
            if part.is_empty() {
                return Err(ConstraintError::InvalidConstraint(text.to_string()));
            }
            comparators.push(parse_comparator(part)?);
        }

        Ok(Self {
            raw: trimmed.to_string(),
            comparators,
        })
    }

    /// Whether the constraint places no restriction at all.
    pub fn is_any(&self) -> bool {
        self.comparators.is_empty()
    }

    /// Whether `version` satisfies every conjunct.
    pub fn matches(&self, version: &Version) -> bool {
        self.comparators.iter().all(|c| c.matches(version))
    }

    /// The constraint source text.
    pub fn as_str(&self) -> &str {
        if self.raw.is_empty() { "*" } else { &self.raw }
    }
}

impl FromStr for VersionConstraint {
    type Err = ConstraintError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionConstraint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn parse_comparator(part: &str) -> Result<Comparator, ConstraintError> {
    let (op, rest) = if let Some(rest) = part.strip_prefix("~>") {
        (Op::Pessimistic, rest)
    } else if let Some(rest) = part.strip_prefix("!=") {
        (Op::Ne, rest)
    } else if let Some(rest) = part.strip_prefix("<=") {
        (Op::Le, rest)
    } else if let Some(rest) = part.strip_prefix(">=") {
        (Op::Ge, rest)
    } else if let Some(rest) = part.strip_prefix('=') {
        (Op::Eq, rest)
    } else if let Some(rest) = part.strip_prefix('<') {
        (Op::Lt, rest)
    } else if let Some(rest) = part.strip_prefix('>') {
        (Op::Gt, rest)
    } else {
        (Op::Eq, part)
    };

    let rest = rest.trim();
    if rest.is_empty() {
        return Err(ConstraintError::InvalidConstraint(part.to_string()));
    }

    Ok(Comparator {
        op,
        pattern: Pattern::parse(rest)?,
    })
}
