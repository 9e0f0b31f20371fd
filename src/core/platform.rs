//! Normalized OS/arch values and wildcard matching.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Wildcard sentinel matching any OS or architecture.
pub const ANY: &str = "any";

/// A normalized `{os, arch}` pair. Either axis may be the sentinel `any`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system (e.g. `linux`, `darwin`, `windows`) or `any`.
    pub os: String,
    /// CPU architecture (e.g. `amd64`, `arm64`) or `any`.
    pub arch: String,
}

impl Platform {
    /// Create a platform, normalizing empty axes to `any`.
    pub fn new(os: &str, arch: &str) -> Self {
        Self {
            os: normalize(os),
            arch: normalize(arch),
        }
    }

    /// The fully wildcarded platform.
    pub fn any() -> Self {
        Self {
            os: ANY.to_string(),
            arch: ANY.to_string(),
        }
    }

    /// The platform of the running host.
    pub fn current() -> Self {
        Self {
            os: current_os().to_string(),
            arch: current_arch().to_string(),
        }
    }

    /// Per-axis match: equal, or either side is `any`.
    pub fn matches(&self, other: &Platform) -> bool {
        axis_matches(&self.os, &other.os) && axis_matches(&self.arch, &other.arch)
    }

    /// Whether both axes are the `any` sentinel.
    pub fn is_any(&self) -> bool {
        self.os == ANY && self.arch == ANY
    }
}

impl Default for Platform {
    fn default() -> Self {
        Self::any()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.os, self.arch)
    }
}

/// Normalize an axis value: empty means `any`.
pub fn normalize(value: &str) -> String {
    if value.is_empty() {
        ANY.to_string()
    } else {
        value.to_string()
    }
}

fn axis_matches(a: &str, b: &str) -> bool {
    a == b || a == ANY || b == ANY
}

/// OS string of the running host.
pub fn current_os() -> &'static str {
    if cfg!(target_os = "macos") {
        "darwin"
    } else if cfg!(target_os = "windows") {
        "windows"
    } else {
        "linux"
    }
}

/// Architecture string of the running host.
pub fn current_arch() -> &'static str {
    if cfg!(target_arch = "aarch64") {
        "arm64"
    } else {
        "amd64"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        let a = Platform::new("linux", "amd64");
        let b = Platform::new("linux", "amd64");
        assert!(a.matches(&b));
    }

    #[test]
    fn test_mismatch() {
        let a = Platform::new("linux", "amd64");
        let b = Platform::new("darwin", "amd64");
        assert!(!a.matches(&b));

        let c = Platform::new("linux", "arm64");
        assert!(!a.matches(&c));
    }

    #[test]
    fn test_any_is_wildcard_on_either_side() {
        let concrete = Platform::new("linux", "amd64");
        assert!(Platform::any().matches(&concrete));
        assert!(concrete.matches(&Platform::any()));

        let os_only = Platform::new("linux", ANY);
        assert!(os_only.matches(&concrete));
        assert!(concrete.matches(&os_only));
    }

    #[test]
    fn test_empty_normalizes_to_any() {
        let p = Platform::new("", "");
        assert!(p.is_any());
        assert_eq!(p.to_string(), "any/any");
    }

    #[test]
    fn test_current_is_concrete() {
        let p = Platform::current();
        assert_ne!(p.os, ANY);
        assert_ne!(p.arch, ANY);
    }
}
