//! Artifact manager: install, verify, uninstall and update against the
//! installed database.
//!
//! Filesystem mutations follow a fixed order per artifact: meta dir placed,
//! data dir placed, database saved, post hook run. A failure rolls back to
//! the previous steady state; after the moves that means removing both
//! directories and restoring the database from the pre-mutation snapshot.
//! The database writer lock is held only for in-memory mutation plus the
//! save; hooks always run outside the lock.

use crate::core::artifact::{
    self, ArtifactError, ArtifactRef, HookName, METADATA_FILE, Metadata,
};
use crate::core::index::IndexArtifactDescriptor;
use crate::core::verify;
use crate::hooks::{self, HookContext, HookOperation, HookRunner};
use crate::io::archive;
use crate::ops::OpError;
use crate::store::db::{
    ArtifactStatus, DbError, InstallationReason, InstalledArtifact, InstalledDatabase,
    InstalledFile,
};
use chrono::{SecondsFormat, Utc};
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// Filesystem layout the manager operates on.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    pub database_path: PathBuf,
    pub artifact_cache_dir: PathBuf,
    pub meta_install_dir: PathBuf,
    pub data_install_dir: PathBuf,
    /// Staging area; must live on the same volume as the install dirs so
    /// final placement is a rename.
    pub tmp_dir: PathBuf,
}

impl ManagerConfig {
    /// The standard layout below a root directory.
    pub fn under(root: &Path) -> Self {
        Self {
            database_path: root.join("state").join("installed.json"),
            artifact_cache_dir: root.join("cache").join("artifacts"),
            meta_install_dir: root.join("install").join("meta"),
            data_install_dir: root.join("install").join("data"),
            tmp_dir: root.join("tmp"),
        }
    }

    /// The layout under the default gotya home (`~/.gotya`).
    ///
    /// # Panics
    /// Panics if the home directory cannot be determined.
    pub fn default_layout() -> Self {
        Self {
            database_path: crate::installed_db_path(),
            artifact_cache_dir: crate::artifact_cache_path(),
            meta_install_dir: crate::meta_install_path(),
            data_install_dir: crate::data_install_path(),
            tmp_dir: crate::tmp_path(),
        }
    }
}

enum InstallFlavor {
    Fresh {
        reason: InstallationReason,
    },
    Replacement {
        reason: InstallationReason,
        old_version: String,
    },
}

/// Orchestrates artifact lifecycle operations.
pub struct ArtifactManager {
    config: ManagerConfig,
    db: RwLock<InstalledDatabase>,
    hook_runner: Arc<dyn HookRunner>,
}

impl fmt::Debug for ArtifactManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArtifactManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ArtifactManager {
    /// Create the working directories and load the installed database.
    pub fn open(
        config: ManagerConfig,
        hook_runner: Arc<dyn HookRunner>,
    ) -> Result<Self, OpError> {
        for dir in [
            &config.artifact_cache_dir,
            &config.meta_install_dir,
            &config.data_install_dir,
            &config.tmp_dir,
        ] {
            fs::create_dir_all(dir)?;
        }
        if let Some(parent) = config.database_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let db = InstalledDatabase::load_from(&config.database_path)?;
        Ok(Self {
            config,
            db: RwLock::new(db),
            hook_runner,
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Snapshot of every database record.
    pub fn installed(&self) -> Result<Vec<InstalledArtifact>, OpError> {
        Ok(self.read_db()?.all())
    }

    /// Copy of the record for `name`, placeholder included.
    pub fn find_installed(&self, name: &str) -> Result<Option<InstalledArtifact>, OpError> {
        Ok(self.read_db()?.find(name).cloned())
    }

    /// Whether a non-placeholder record for `name` exists.
    pub fn is_installed(&self, name: &str) -> Result<bool, OpError> {
        Ok(self.read_db()?.is_installed(name))
    }

    /// Case-insensitive substring search over installed names.
    pub fn filter_installed(&self, pattern: &str) -> Result<Vec<InstalledArtifact>, OpError> {
        Ok(self.read_db()?.filter(pattern))
    }

    /// Where the packed archive for `reference` lives in the cache.
    pub fn cached_artifact_path(&self, reference: &ArtifactRef) -> PathBuf {
        self.config.artifact_cache_dir.join(reference.filename())
    }

    /// Verify the cached archive for `desc` against its descriptor.
    pub fn verify_artifact(&self, desc: &IndexArtifactDescriptor) -> Result<(), OpError> {
        let reference = desc.artifact_ref();
        let path = self.cached_artifact_path(&reference);
        self.check_archive_checksum(desc, &path)?;
        verify::verify_file(&path, Some(&reference))?;
        Ok(())
    }

    /// Install a verified local archive.
    pub fn install_artifact(
        &self,
        desc: &IndexArtifactDescriptor,
        archive_path: &Path,
        reason: InstallationReason,
        cancel: &CancellationToken,
    ) -> Result<(), OpError> {
        self.install_inner(desc, archive_path, InstallFlavor::Fresh { reason }, cancel)
    }

    /// Uninstall `name`. With `purge` the meta and data trees are removed
    /// wholesale; otherwise only the files recorded at install time go,
    /// followed by a bottom-up sweep of now-empty directories.
    pub fn uninstall_artifact(
        &self,
        name: &str,
        purge: bool,
        cancel: &CancellationToken,
    ) -> Result<(), OpError> {
        self.uninstall_inner(name, purge, true, cancel)
    }

    /// Replace an installed artifact with a new version.
    ///
    /// Runs as uninstall-then-install and is deliberately non-atomic: when
    /// the install half fails, the old version is not restored.
    pub fn update_artifact(
        &self,
        desc: &IndexArtifactDescriptor,
        new_archive_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), OpError> {
        check_cancelled(cancel)?;

        let existing = self
            .find_installed(&desc.name)?
            .filter(|a| !a.is_missing())
            .ok_or_else(|| OpError::NotInstalled(desc.name.clone()))?;

        if existing.version == desc.version && existing.installed_from == desc.url {
            return Err(OpError::AlreadyAtLatestVersion {
                name: desc.name.clone(),
                version: desc.version.clone(),
            });
        }

        self.check_archive_checksum(desc, new_archive_path)
            .map_err(|e| OpError::step("verifying replacement archive", e))?;
        verify::verify_file(new_archive_path, Some(&desc.artifact_ref()))
            .map_err(|e| OpError::step("verifying replacement artifact", e))?;

        // The old installation gets its say before it is removed.
        let old_meta_dir = self.record_meta_dir(&existing);
        let old_data_dir = self.record_data_dir(&existing);
        if let Ok(old_metadata) = Metadata::load(&old_meta_dir.join(METADATA_FILE)) {
            let mut ctx =
                HookContext::new(&desc.name, &desc.version, HookOperation::Update);
            ctx.meta_dir = path_string(&old_meta_dir);
            if old_data_dir.exists() {
                ctx.data_dir = path_string(&old_data_dir);
            }
            ctx.old_version = existing.version.clone();
            self.run_declared_hook(&old_metadata, HookName::PreUpdate, &old_meta_dir, &ctx)?;
        }

        self.uninstall_inner(&desc.name, true, false, cancel)
            .map_err(|e| OpError::step("removing previous version", e))?;

        self.install_inner(
            desc,
            new_archive_path,
            InstallFlavor::Replacement {
                reason: existing.installation_reason,
                old_version: existing.version.clone(),
            },
            cancel,
        )
        .map_err(|e| OpError::step("installing replacement", e))
    }

    /// Transitive dependents of `name`, dependents first, `name` last --
    /// the order a cascading uninstall would use.
    pub fn reverse_resolve(&self, name: &str) -> Result<Vec<String>, OpError> {
        let db = self.read_db()?;
        if db.find(name).is_none() {
            return Err(OpError::NotInstalled(name.to_string()));
        }
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        collect_dependents(&db, name, &mut visited, &mut order);
        Ok(order)
    }

    /// Installed artifacts that were pulled in automatically and are no
    /// longer depended upon.
    pub fn orphaned_automatic_artifacts(&self) -> Result<Vec<InstalledArtifact>, OpError> {
        Ok(self
            .read_db()?
            .all()
            .into_iter()
            .filter(|a| {
                !a.is_missing()
                    && a.installation_reason == InstallationReason::Automatic
                    && a.reverse_dependencies.is_empty()
            })
            .collect())
    }

    /// Flip an artifact's installation reason to manual.
    pub fn set_artifact_manually_installed(&self, name: &str) -> Result<(), OpError> {
        let mut db = self.write_db()?;
        let snapshot = db.clone();
        db.set_installation_reason(name, InstallationReason::Manual)
            .map_err(|e| match e {
                DbError::ArtifactNotFound(n) => OpError::NotInstalled(n),
                other => other.into(),
            })?;
        if let Err(e) = db.save_to(&self.config.database_path) {
            *db = snapshot;
            return Err(OpError::step("saving database", e));
        }
        Ok(())
    }

    fn install_inner(
        &self,
        desc: &IndexArtifactDescriptor,
        archive_path: &Path,
        flavor: InstallFlavor,
        cancel: &CancellationToken,
    ) -> Result<(), OpError> {
        check_cancelled(cancel)?;

        if self.is_installed(&desc.name)? {
            return Err(OpError::AlreadyInstalled(desc.name.clone()));
        }

        let reference = desc.artifact_ref();
        self.check_archive_checksum(desc, archive_path)
            .map_err(|e| OpError::step("verifying archive", e))?;
        let metadata = verify::verify_file(archive_path, Some(&reference))
            .map_err(|e| OpError::step("verifying artifact", e))?;

        check_cancelled(cancel)?;

        fs::create_dir_all(&self.config.tmp_dir)?;
        let staging = TempDir::new_in(&self.config.tmp_dir)?;
        archive::extract(archive_path, staging.path())
            .map_err(|e| OpError::step("extracting artifact", e))?;

        let final_meta = self.config.meta_install_dir.join(&desc.name);
        let final_data = self.config.data_install_dir.join(&desc.name);
        if final_meta.exists() {
            return Err(OpError::InstallTreeExists(final_meta));
        }
        if final_data.exists() {
            return Err(OpError::InstallTreeExists(final_data));
        }

        let staged_meta = staging.path().join(artifact::META_DIR);
        let staged_data = staging.path().join(artifact::DATA_DIR);
        let has_data = staged_data.is_dir();

        check_cancelled(cancel)?;

        if matches!(flavor, InstallFlavor::Fresh { .. }) {
            let mut ctx = HookContext::new(&desc.name, &desc.version, HookOperation::Install);
            ctx.temp_meta_dir = path_string(&staged_meta);
            ctx.final_meta_dir = path_string(&final_meta);
            ctx.final_data_dir = path_string(&final_data);
            self.run_declared_hook(&metadata, HookName::PreInstall, &staged_meta, &ctx)?;
        }

        fs::create_dir_all(&self.config.meta_install_dir)?;
        fs::rename(&staged_meta, &final_meta)
            .map_err(|e| OpError::step("placing meta directory", OpError::Io(e)))?;

        if has_data {
            if let Err(e) = place_data(&self.config.data_install_dir, &staged_data, &final_data)
            {
                // The meta move must not survive a failed data move.
                let _ = fs::remove_dir_all(&final_meta);
                return Err(OpError::step("placing data directory", OpError::Io(e)));
            }
        }

        if let Err(err) = self.finish_install(
            desc,
            &metadata,
            &flavor,
            archive_path,
            &final_meta,
            &final_data,
            has_data,
        ) {
            let _ = fs::remove_dir_all(&final_meta);
            if has_data {
                let _ = fs::remove_dir_all(&final_data);
            }
            return Err(err);
        }

        tracing::info!("installed {}@{}", desc.name, desc.version);
        Ok(())
    }

    /// Database write plus post hook; the caller reverses the directory
    /// moves when this fails.
    #[allow(clippy::too_many_arguments)]
    fn finish_install(
        &self,
        desc: &IndexArtifactDescriptor,
        metadata: &Metadata,
        flavor: &InstallFlavor,
        archive_path: &Path,
        final_meta: &Path,
        final_data: &Path,
        has_data: bool,
    ) -> Result<(), OpError> {
        let checksum = if desc.checksum.is_empty() {
            verify::sha256_file(archive_path)?
        } else {
            desc.checksum.clone()
        };
        let reason = match flavor {
            InstallFlavor::Fresh { reason } | InstallFlavor::Replacement { reason, .. } => *reason,
        };

        let record = InstalledArtifact {
            name: desc.name.clone(),
            version: desc.version.clone(),
            description: metadata.description.clone(),
            installed_at: Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true),
            installed_from: desc.url.clone(),
            artifact_meta_dir: path_string(final_meta),
            artifact_data_dir: if has_data {
                path_string(final_data)
            } else {
                String::new()
            },
            meta_files: list_files(final_meta)?,
            data_files: if has_data {
                list_files(final_data)?
            } else {
                Vec::new()
            },
            reverse_dependencies: Vec::new(),
            status: ArtifactStatus::Installed,
            checksum,
            installation_reason: reason,
        };

        let snapshot;
        {
            let mut db = self.write_db()?;
            snapshot = db.clone();
            db.add(record);
            for dependency in &metadata.dependencies {
                match db.find(&dependency.name) {
                    Some(existing) => {
                        let mut updated = existing.clone();
                        updated.add_reverse_dependency(&desc.name);
                        db.add(updated);
                    }
                    None => db.add(InstalledArtifact::missing_placeholder(
                        &dependency.name,
                        &desc.name,
                    )),
                }
            }
            if let Err(e) = db.save_to(&self.config.database_path) {
                *db = snapshot;
                return Err(OpError::step("saving database", e));
            }
        }

        let (hook, operation) = match flavor {
            InstallFlavor::Fresh { .. } => (HookName::PostInstall, HookOperation::Install),
            InstallFlavor::Replacement { .. } => (HookName::PostUpdate, HookOperation::Update),
        };
        let mut ctx = HookContext::new(&desc.name, &desc.version, operation);
        ctx.meta_dir = path_string(final_meta);
        if has_data {
            ctx.data_dir = path_string(final_data);
        }
        if let InstallFlavor::Replacement { old_version, .. } = flavor {
            ctx.old_version = old_version.clone();
        }

        if let Err(err) = self.run_declared_hook(metadata, hook, final_meta, &ctx) {
            let mut db = self.write_db()?;
            *db = snapshot;
            let _ = db.save_to(&self.config.database_path);
            return Err(err);
        }
        Ok(())
    }

    fn uninstall_inner(
        &self,
        name: &str,
        purge: bool,
        run_hooks: bool,
        cancel: &CancellationToken,
    ) -> Result<(), OpError> {
        check_cancelled(cancel)?;

        let record = self
            .find_installed(name)?
            .filter(|a| !a.is_missing())
            .ok_or_else(|| OpError::NotInstalled(name.to_string()))?;

        let meta_dir = self.record_meta_dir(&record);
        let data_dir = self.record_data_dir(&record);

        // A damaged installation still uninstalls, minus its hooks.
        let hooks_map = match Metadata::load(&meta_dir.join(METADATA_FILE)) {
            Ok(metadata) => metadata.hooks,
            Err(err) => {
                tracing::warn!("cannot read metadata of '{name}': {err}");
                Default::default()
            }
        };

        // The post-uninstall script's home is about to disappear.
        let mut preserved: Option<(TempDir, PathBuf)> = None;
        if run_hooks {
            if let Some(script) = hooks_map.get(&HookName::PostUninstall) {
                let source = meta_dir.join(script);
                if source.is_file() {
                    fs::create_dir_all(&self.config.tmp_dir)?;
                    let keep = TempDir::new_in(&self.config.tmp_dir)?;
                    let dest = keep.path().join(script);
                    fs::copy(&source, &dest)?;
                    preserved = Some((keep, dest));
                }
            }

            if let Some(script) = hooks_map.get(&HookName::PreUninstall) {
                let mut ctx = HookContext::new(name, &record.version, HookOperation::Uninstall);
                ctx.meta_dir = path_string(&meta_dir);
                if data_dir.exists() {
                    ctx.data_dir = path_string(&data_dir);
                }
                hooks::execute_hook(self.hook_runner.as_ref(), &meta_dir.join(script), &ctx)?;
            }
        }

        check_cancelled(cancel)?;

        if purge {
            if meta_dir.exists() {
                fs::remove_dir_all(&meta_dir)?;
            }
            if data_dir.exists() {
                fs::remove_dir_all(&data_dir)?;
            }
        } else {
            remove_listed(&meta_dir, &record.meta_files)?;
            remove_listed(&data_dir, &record.data_files)?;
            prune_empty_dirs(&meta_dir);
            prune_empty_dirs(&data_dir);
        }

        {
            let mut db = self.write_db()?;
            let snapshot = db.clone();
            db.remove(name);
            if let Err(e) = db.save_to(&self.config.database_path) {
                *db = snapshot;
                return Err(OpError::step("saving database", e));
            }
        }

        if let Some((_keep, script)) = preserved {
            let mut ctx = HookContext::new(name, &record.version, HookOperation::Uninstall);
            ctx.was_meta_dir = path_string(&meta_dir);
            ctx.was_data_dir = path_string(&data_dir);
            if let Err(err) = hooks::execute_hook(self.hook_runner.as_ref(), &script, &ctx) {
                // The uninstall itself has completed; what to do about a
                // failed post-uninstall script is caller policy.
                tracing::warn!("post-uninstall hook failed for '{name}': {err}");
            }
        }

        tracing::info!("uninstalled {}@{}", name, record.version);
        Ok(())
    }

    fn run_declared_hook(
        &self,
        metadata: &Metadata,
        hook: HookName,
        script_dir: &Path,
        ctx: &HookContext,
    ) -> Result<(), OpError> {
        if let Some(script) = metadata.hooks.get(&hook) {
            hooks::execute_hook(self.hook_runner.as_ref(), &script_dir.join(script), ctx)?;
        }
        Ok(())
    }

    /// Compare the packed archive against the descriptor checksum, when the
    /// descriptor carries one.
    fn check_archive_checksum(
        &self,
        desc: &IndexArtifactDescriptor,
        archive_path: &Path,
    ) -> Result<(), OpError> {
        if desc.checksum.is_empty() {
            return Ok(());
        }
        if !archive_path.is_file() {
            return Err(ArtifactError::NotFound(archive_path.to_path_buf()).into());
        }
        let actual = verify::sha256_file(archive_path)?;
        if actual.eq_ignore_ascii_case(&desc.checksum) {
            Ok(())
        } else {
            Err(ArtifactError::Invalid(format!(
                "archive checksum mismatch: expected {}, got {actual}",
                desc.checksum
            ))
            .into())
        }
    }

    fn record_meta_dir(&self, record: &InstalledArtifact) -> PathBuf {
        if record.artifact_meta_dir.is_empty() {
            self.config.meta_install_dir.join(&record.name)
        } else {
            PathBuf::from(&record.artifact_meta_dir)
        }
    }

    fn record_data_dir(&self, record: &InstalledArtifact) -> PathBuf {
        if record.artifact_data_dir.is_empty() {
            self.config.data_install_dir.join(&record.name)
        } else {
            PathBuf::from(&record.artifact_data_dir)
        }
    }

    fn read_db(&self) -> Result<RwLockReadGuard<'_, InstalledDatabase>, OpError> {
        self.db.read().map_err(|e| OpError::Lock(e.to_string()))
    }

    fn write_db(&self) -> Result<RwLockWriteGuard<'_, InstalledDatabase>, OpError> {
        self.db.write().map_err(|e| OpError::Lock(e.to_string()))
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<(), OpError> {
    if cancel.is_cancelled() {
        Err(OpError::Cancelled)
    } else {
        Ok(())
    }
}

fn place_data(parent: &Path, staged: &Path, dest: &Path) -> std::io::Result<()> {
    fs::create_dir_all(parent)?;
    fs::rename(staged, dest)
}

/// Every regular file under `root` with its digest, paths relative to
/// `root` with forward slashes.
fn list_files(root: &Path) -> Result<Vec<InstalledFile>, OpError> {
    let mut files = Vec::new();
    for entry in WalkDir::new(root).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::other)?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .map_err(std::io::Error::other)?;
        files.push(InstalledFile {
            path: archive::slash_name(rel),
            hash: verify::sha256_file(entry.path())?,
        });
    }
    Ok(files)
}

/// Remove the recorded files below `root`; files already gone are fine.
fn remove_listed(root: &Path, files: &[InstalledFile]) -> Result<(), OpError> {
    for file in files {
        let path = root.join(&file.path);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Bottom-up sweep removing directories that ended up empty, the root
/// itself included. Non-empty directories are left alone.
fn prune_empty_dirs(root: &Path) {
    if !root.is_dir() {
        return;
    }
    for entry in WalkDir::new(root).contents_first(true).into_iter().flatten() {
        if entry.file_type().is_dir() {
            let _ = fs::remove_dir(entry.path());
        }
    }
}

fn collect_dependents(
    db: &InstalledDatabase,
    name: &str,
    visited: &mut HashSet<String>,
    order: &mut Vec<String>,
) {
    if !visited.insert(name.to_string()) {
        return;
    }
    if let Some(record) = db.find(name) {
        let mut dependents = record.reverse_dependencies.clone();
        dependents.sort();
        for dependent in dependents {
            collect_dependents(db, &dependent, visited, order);
        }
    }
    order.push(name.to_string());
}

fn path_string(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
