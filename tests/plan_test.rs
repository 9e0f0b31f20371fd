//! Resolver-to-executor flow: resolve a request set against an index of
//! really packed artifacts, then execute the plan with a local downloader.

use anyhow::Result;
use async_trait::async_trait;
use gotya::core::artifact::Dependency;
use gotya::core::index::{IndexArtifactDescriptor, IndexStore, Repository};
use gotya::core::packer::{self, PackRequest};
use gotya::core::platform::Platform;
use gotya::core::resolver::{ArtifactAction, ResolveRequest, Resolver};
use gotya::core::verify;
use gotya::hooks::NoopHookRunner;
use gotya::io::download::{DownloadError, Downloader};
use gotya::ops::plan::execute_plan;
use gotya::ops::{ArtifactManager, ManagerConfig, OpError};
use gotya::store::db::InstallationReason;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Serves `https://repo.example.com/<file>` from a local directory.
struct LocalDownloader {
    dir: PathBuf,
    fetched: Mutex<Vec<String>>,
}

impl LocalDownloader {
    fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            fetched: Mutex::new(Vec::new()),
        }
    }

    fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl Downloader for LocalDownloader {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), DownloadError> {
        if cancel.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        let file = url.rsplit('/').next().unwrap_or_default();
        fs::copy(self.dir.join(file), dest)?;
        self.fetched.lock().unwrap().push(file.to_string());
        Ok(())
    }
}

struct Harness {
    _root: TempDir,
    manager: ArtifactManager,
    index: IndexStore,
    downloader: LocalDownloader,
}

impl Harness {
    /// Pack each `(name, version, deps)` artifact and index it.
    fn new(artifacts: &[(&str, &str, &[(&str, &str)])]) -> Result<Self> {
        let root = TempDir::new()?;
        let packed = root.path().join("packed");
        fs::create_dir_all(&packed)?;

        let mut descriptors = Vec::new();
        for (name, version, deps) in artifacts {
            let input = root.path().join(format!("input-{name}-{version}"));
            let payload = input.join("data").join(format!("{name}.txt"));
            fs::create_dir_all(payload.parent().unwrap())?;
            fs::write(&payload, format!("{name} {version}"))?;

            let dependencies: Vec<Dependency> = deps
                .iter()
                .map(|(n, c)| Dependency {
                    name: (*n).to_string(),
                    version_constraint: (*c).to_string(),
                })
                .collect();

            let archive = packer::pack(&PackRequest {
                name: (*name).to_string(),
                version: (*version).to_string(),
                os: "linux".into(),
                arch: "amd64".into(),
                maintainer: "test@example.com".into(),
                description: String::new(),
                dependencies: dependencies.clone(),
                hooks: BTreeMap::new(),
                input_dir: input,
                output_dir: packed.clone(),
            })?;

            descriptors.push(IndexArtifactDescriptor {
                name: (*name).to_string(),
                version: (*version).to_string(),
                description: String::new(),
                url: format!(
                    "https://repo.example.com/{}",
                    archive.file_name().unwrap().to_string_lossy()
                ),
                checksum: verify::sha256_file(&archive)?,
                size: fs::metadata(&archive)?.len(),
                os: "linux".into(),
                arch: "amd64".into(),
                dependencies,
            });
        }

        let mut index = IndexStore::new();
        index.add_repository(
            Repository {
                name: "main".into(),
                url: "https://repo.example.com".into(),
                enabled: true,
                priority: 0,
            },
            descriptors,
        );

        let manager = ArtifactManager::open(
            ManagerConfig::under(&root.path().join("home")),
            Arc::new(NoopHookRunner),
        )?;
        let downloader = LocalDownloader::new(&packed);

        Ok(Self {
            _root: root,
            manager,
            index,
            downloader,
        })
    }
}

fn platform() -> Platform {
    Platform::new("linux", "amd64")
}

#[tokio::test]
async fn test_resolve_and_execute_chain() -> Result<()> {
    let harness = Harness::new(&[
        ("a", "1.0.0", &[("b", ">= 1.0.0")]),
        ("b", "1.0.0", &[]),
    ])?;

    let db = gotya::store::db::InstalledDatabase::new();
    let plan = Resolver::new(&harness.index, &db)
        .resolve(&[ResolveRequest::install("a", "= 1.0.0", &platform())])?;

    let names: Vec<&str> = plan.artifacts.iter().map(|p| p.name.as_str()).collect();
    assert_eq!(names, vec!["b", "a"]);

    execute_plan(
        &harness.manager,
        &harness.downloader,
        &plan,
        &CancellationToken::new(),
    )
    .await?;

    assert!(harness.manager.is_installed("a")?);
    assert!(harness.manager.is_installed("b")?);
    assert_eq!(
        harness.downloader.fetched(),
        vec!["b_1.0.0_linux_amd64.gotya", "a_1.0.0_linux_amd64.gotya"]
    );

    // The direct request is manual, its dependency automatic.
    let a = harness.manager.find_installed("a")?.unwrap();
    assert_eq!(a.installation_reason, InstallationReason::Manual);
    let b = harness.manager.find_installed("b")?.unwrap();
    assert_eq!(b.installation_reason, InstallationReason::Automatic);
    assert_eq!(b.reverse_dependencies, vec!["a"]);
    Ok(())
}

#[tokio::test]
async fn test_skip_entries_do_no_io() -> Result<()> {
    let harness = Harness::new(&[("lib", "1.0.0", &[]), ("tool", "1.0.0", &[])])?;

    // Install lib first, then resolve with a keep request for it.
    let lib_desc = harness
        .index
        .find_best("lib", "", &platform())?
        .expect("lib in index");
    let cached = harness
        .manager
        .cached_artifact_path(&lib_desc.artifact_ref());
    harness
        .downloader
        .download(&lib_desc.url, &cached, &CancellationToken::new())
        .await?;
    harness.manager.install_artifact(
        &lib_desc,
        &cached,
        InstallationReason::Manual,
        &CancellationToken::new(),
    )?;

    let db = gotya::store::db::InstalledDatabase::load_from(
        &harness.manager.config().database_path,
    )?;
    let plan = Resolver::new(&harness.index, &db).resolve(&[
        ResolveRequest::install("tool", "= 1.0.0", &platform()),
        ResolveRequest::keep("lib", "1.0.0", &platform()),
    ])?;

    let lib_entry = plan.find("lib").expect("lib entry");
    assert_eq!(lib_entry.action, ArtifactAction::Skip);

    let before = harness.downloader.fetched().len();
    execute_plan(
        &harness.manager,
        &harness.downloader,
        &plan,
        &CancellationToken::new(),
    )
    .await?;

    let fetched = harness.downloader.fetched();
    assert_eq!(fetched.len() - before, 1, "only tool is fetched: {fetched:?}");
    assert!(fetched.contains(&"tool_1.0.0_linux_amd64.gotya".to_string()));
    Ok(())
}

#[tokio::test]
async fn test_cancelled_plan_does_nothing() -> Result<()> {
    let harness = Harness::new(&[("a", "1.0.0", &[])])?;

    let db = gotya::store::db::InstalledDatabase::new();
    let plan = Resolver::new(&harness.index, &db)
        .resolve(&[ResolveRequest::install("a", "", &platform())])?;

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = execute_plan(&harness.manager, &harness.downloader, &plan, &cancel)
        .await
        .unwrap_err();
    assert!(matches!(err, OpError::Cancelled));
    assert!(!harness.manager.is_installed("a")?);
    assert!(harness.downloader.fetched().is_empty());
    Ok(())
}
