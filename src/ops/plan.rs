//! Install plan execution.
//!
//! Walks a resolver plan entry by entry: skip entries perform no I/O,
//! install and update entries download into the artifact cache (when the
//! archive is not already there) and hand off to the manager. Entries run
//! strictly in plan order; the first failure aborts the run.

use crate::core::resolver::{ArtifactAction, InstallPlan, REASON_USER_REQUEST};
use crate::io::download::Downloader;
use crate::ops::manager::ArtifactManager;
use crate::ops::OpError;
use crate::store::db::InstallationReason;
use tokio_util::sync::CancellationToken;

/// Execute `plan` against `manager`, fetching archives via `downloader`.
///
/// Artifacts the user asked for directly are recorded as manually
/// installed; pulled-in dependencies as automatic.
pub async fn execute_plan(
    manager: &ArtifactManager,
    downloader: &dyn Downloader,
    plan: &InstallPlan,
    cancel: &CancellationToken,
) -> Result<(), OpError> {
    for entry in &plan.artifacts {
        if cancel.is_cancelled() {
            return Err(OpError::Cancelled);
        }

        match entry.action {
            ArtifactAction::Skip => {
                tracing::info!("skipping {}@{}: {}", entry.name, entry.version, entry.reason);
            }
            ArtifactAction::Install | ArtifactAction::Update => {
                let desc = entry.to_descriptor();
                let dest = manager.cached_artifact_path(&desc.artifact_ref());
                if !dest.is_file() {
                    tracing::debug!("fetching {} -> {}", entry.url, dest.display());
                    downloader.download(&entry.url, &dest, cancel).await?;
                }

                if entry.action == ArtifactAction::Install {
                    let reason = if entry.reason == REASON_USER_REQUEST {
                        InstallationReason::Manual
                    } else {
                        InstallationReason::Automatic
                    };
                    manager.install_artifact(&desc, &dest, reason, cancel)?;
                } else {
                    manager.update_artifact(&desc, &dest, cancel)?;
                }
            }
        }
    }
    Ok(())
}
