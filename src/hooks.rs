//! Hook host.
//!
//! Artifacts may ship lifecycle scripts (`meta/<hook>.tengo`); the embedded
//! scripting engine itself is a collaborator behind [`HookRunner`]. This
//! module only defines the host contract: the typed context handed to a
//! script and the failure semantics.

use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum HookError {
    #[error("hook script not found: {0}")]
    ScriptNotFound(PathBuf),

    #[error("hook {script} failed during {operation}: {source}")]
    Failed {
        script: PathBuf,
        operation: HookOperation,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

/// Which lifecycle operation a hook is running for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOperation {
    Install,
    Update,
    Uninstall,
}

impl fmt::Display for HookOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            HookOperation::Install => "install",
            HookOperation::Update => "update",
            HookOperation::Uninstall => "uninstall",
        };
        f.write_str(s)
    }
}

/// Variables exposed to a hook script. Directory fields are filled per
/// stage; only non-empty fields are handed to the script.
#[derive(Debug, Clone)]
pub struct HookContext {
    pub artifact_name: String,
    pub artifact_version: String,
    pub operation: HookOperation,
    pub meta_dir: String,
    pub data_dir: String,
    pub temp_meta_dir: String,
    pub final_meta_dir: String,
    pub final_data_dir: String,
    pub was_meta_dir: String,
    pub was_data_dir: String,
    pub old_version: String,
}

impl HookContext {
    /// A context with every directory field empty.
    pub fn new(artifact_name: &str, artifact_version: &str, operation: HookOperation) -> Self {
        Self {
            artifact_name: artifact_name.to_string(),
            artifact_version: artifact_version.to_string(),
            operation,
            meta_dir: String::new(),
            data_dir: String::new(),
            temp_meta_dir: String::new(),
            final_meta_dir: String::new(),
            final_data_dir: String::new(),
            was_meta_dir: String::new(),
            was_data_dir: String::new(),
            old_version: String::new(),
        }
    }

    /// The named string variables a script sees; empty fields are omitted.
    pub fn variables(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            ("artifact_name", self.artifact_name.clone()),
            ("artifact_version", self.artifact_version.clone()),
            ("operation", self.operation.to_string()),
        ];
        for (key, value) in [
            ("meta_dir", &self.meta_dir),
            ("data_dir", &self.data_dir),
            ("temp_meta_dir", &self.temp_meta_dir),
            ("final_meta_dir", &self.final_meta_dir),
            ("final_data_dir", &self.final_data_dir),
            ("was_meta_dir", &self.was_meta_dir),
            ("was_data_dir", &self.was_data_dir),
            ("old_version", &self.old_version),
        ] {
            if !value.is_empty() {
                vars.push((key, value.clone()));
            }
        }
        vars
    }
}

/// The scripting-engine collaborator.
pub trait HookRunner: Send + Sync {
    /// Run `script` with `context` exposed as named string variables.
    fn run(
        &self,
        script: &Path,
        context: &HookContext,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Runner for embedders with scripting disabled: every hook succeeds
/// without executing anything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopHookRunner;

impl HookRunner for NoopHookRunner {
    fn run(
        &self,
        _script: &Path,
        _context: &HookContext,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        Ok(())
    }
}

/// Load and run a hook script. A missing script is a failure; whether to
/// call at all is the caller's decision, based on the artifact metadata.
pub fn execute_hook(
    runner: &dyn HookRunner,
    script: &Path,
    context: &HookContext,
) -> Result<(), HookError> {
    if !script.is_file() {
        return Err(HookError::ScriptNotFound(script.to_path_buf()));
    }
    tracing::debug!(
        "running {} hook for {}@{}",
        context.operation,
        context.artifact_name,
        context.artifact_version
    );
    runner
        .run(script, context)
        .map_err(|source| HookError::Failed {
            script: script.to_path_buf(),
            operation: context.operation,
            source,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    struct FailingRunner;

    impl HookRunner for FailingRunner {
        fn run(
            &self,
            _script: &Path,
            _context: &HookContext,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
            Err("script blew up".into())
        }
    }

    #[test]
    fn test_missing_script_fails() {
        let dir = tempdir().unwrap();
        let ctx = HookContext::new("pkg", "1.0.0", HookOperation::Install);
        let err = execute_hook(&NoopHookRunner, &dir.path().join("nope.tengo"), &ctx).unwrap_err();
        assert!(matches!(err, HookError::ScriptNotFound(_)));
    }

    #[test]
    fn test_runner_failure_is_wrapped() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("pre-install.tengo");
        std::fs::write(&script, "boom()").unwrap();

        let ctx = HookContext::new("pkg", "1.0.0", HookOperation::Install);
        let err = execute_hook(&FailingRunner, &script, &ctx).unwrap_err();
        match err {
            HookError::Failed { operation, .. } => assert_eq!(operation, HookOperation::Install),
            other => panic!("expected Failed, got {other}"),
        }
    }

    #[test]
    fn test_noop_runner_succeeds() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("post-install.tengo");
        std::fs::write(&script, "ok := true").unwrap();

        let ctx = HookContext::new("pkg", "1.0.0", HookOperation::Install);
        execute_hook(&NoopHookRunner, &script, &ctx).unwrap();
    }

    #[test]
    fn test_variables_omit_empty_fields() {
        let mut ctx = HookContext::new("pkg", "1.0.0", HookOperation::Update);
        ctx.old_version = "0.9.0".into();
        ctx.final_meta_dir = "/install/meta/pkg".into();

        let vars = ctx.variables();
        let keys: Vec<&str> = vars.iter().map(|(k, _)| *k).collect();
        assert_eq!(
            keys,
            vec![
                "artifact_name",
                "artifact_version",
                "operation",
                "final_meta_dir",
                "old_version"
            ]
        );
        assert!(vars.iter().any(|(k, v)| *k == "operation" && v == "update"));
    }
}
