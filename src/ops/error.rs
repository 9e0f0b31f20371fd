//! Domain-specific errors for artifact operations.

use crate::core::artifact::ArtifactError;
use crate::core::index::IndexError;
use crate::core::resolver::ResolveError;
use crate::hooks::HookError;
use crate::io::archive::ArchiveError;
use crate::io::download::DownloadError;
use crate::store::db::DbError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OpError {
    #[error("artifact '{0}' is already installed")]
    AlreadyInstalled(String),

    #[error("artifact '{0}' is not installed")]
    NotInstalled(String),

    #[error("artifact '{name}' is already at the latest version {version}")]
    AlreadyAtLatestVersion { name: String, version: String },

    #[error("install tree {0} already exists; remove it manually")]
    InstallTreeExists(PathBuf),

    #[error("operation cancelled")]
    Cancelled,

    #[error("database lock poisoned: {0}")]
    Lock(String),

    #[error("artifact error: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("index error: {0}")]
    Index(#[from] IndexError),

    #[error("resolve error: {0}")]
    Resolve(#[from] ResolveError),

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("hook error: {0}")]
    Hook(#[from] HookError),

    #[error("download error: {0}")]
    Download(#[from] DownloadError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A failure wrapped with the step it happened in; the original error
    /// kind stays reachable through `source()` for programmatic matching.
    #[error("{step} failed: {source}")]
    Step {
        step: &'static str,
        #[source]
        source: Box<OpError>,
    },
}

impl OpError {
    /// Wrap an error with the operation step it occurred in.
    pub fn step(step: &'static str, err: impl Into<OpError>) -> Self {
        Self::Step {
            step,
            source: Box::new(err.into()),
        }
    }

    /// Process exit code for the CLI wrapper: 0 success, 1 generic failure,
    /// 2 invalid usage, 3 not found, 4 version conflict or cycle, 5 I/O or
    /// verification failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            OpError::Step { source, .. } => source.exit_code(),

            OpError::Resolve(ResolveError::NoRequests | ResolveError::Constraint { .. })
            | OpError::Index(IndexError::Constraint(_))
            | OpError::Artifact(
                ArtifactError::InvalidName(_)
                | ArtifactError::InvalidVersion(_)
                | ArtifactError::EmptyOs
                | ArtifactError::EmptyArch
                | ArtifactError::Validation(_),
            ) => 2,

            OpError::NotInstalled(_)
            | OpError::Resolve(ResolveError::Unresolved { .. })
            | OpError::Artifact(ArtifactError::NotFound(_))
            | OpError::Db(DbError::ArtifactNotFound(_)) => 3,

            OpError::Resolve(ResolveError::Conflict { .. } | ResolveError::Cycle { .. }) => 4,

            OpError::Artifact(_)
            | OpError::Archive(_)
            | OpError::Index(_)
            | OpError::Db(_)
            | OpError::Download(_)
            | OpError::Io(_) => 5,

            OpError::AlreadyInstalled(_)
            | OpError::AlreadyAtLatestVersion { .. }
            | OpError::InstallTreeExists(_)
            | OpError::Cancelled
            | OpError::Lock(_)
            | OpError::Hook(_) => 1,
        }
    }
}
