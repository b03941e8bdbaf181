//! Install orchestrator (C9): the state machine stitching fingerprint,
//! store, tree-store, snapshot, fetch and pool components into one
//! install/restore/sync flow (spec.md §4.9). Grounded in
//! `moss::client::install::Installer`'s drive loop, generalized from
//! moss's `.stone` transaction commit to the snapshot-first flow this
//! spec calls for.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::config::FlashConfig;
use crate::fallback::{FallbackFlags, FallbackResolver};
use crate::fetch;
use crate::fs;
use crate::hooks::{self, HookSink};
use crate::manifest::{DependencySet, PackageId};
use crate::pool::{RetryPolicy, WorkerPool};
use crate::progress::{self, ProgressSink};
use crate::snapshot;
use crate::store::{PackageStore, TreeStore};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Fs(#[from] fs::Error),
    #[error(transparent)]
    Store(#[from] crate::store::Error),
    #[error(transparent)]
    Snapshot(#[from] snapshot::Error),
    #[error(transparent)]
    Fetch(#[from] fetch::Error),
    #[error("offline and no fallback satisfied the manifest")]
    OfflineUnsatisfied,
}

#[derive(Debug, Clone)]
pub struct PackageFailure {
    pub pid: PackageId,
    pub reason: String,
    pub retryable: bool,
}

/// Result of one install/restore/sync invocation. `success` is `true`
/// iff `failed.is_empty()`.
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub success: bool,
    pub installed: Vec<PackageId>,
    pub failed: Vec<PackageFailure>,
    pub restored_from_snapshot: bool,
    pub restored_from_tree: bool,
    pub snapshot_path: Option<PathBuf>,
}

impl InstallOutcome {
    fn from_failures(installed: Vec<PackageId>, failed: Vec<PackageFailure>) -> Self {
        Self {
            success: failed.is_empty(),
            installed,
            failed,
            restored_from_snapshot: false,
            restored_from_tree: false,
            snapshot_path: None,
        }
    }
}

/// Drives a single project's install/restore/sync flow against one
/// store pair. Does not itself parse a manifest or lockfile — callers
/// hand in an already-resolved [`DependencySet`].
pub struct InstallOrchestrator<'a> {
    project_dir: PathBuf,
    package_store: &'a PackageStore,
    tree_store: &'a TreeStore,
    config: &'a FlashConfig,
    progress: &'a dyn ProgressSink,
    hooks: &'a dyn HookSink,
}

impl<'a> InstallOrchestrator<'a> {
    pub fn new(
        project_dir: impl Into<PathBuf>,
        package_store: &'a PackageStore,
        tree_store: &'a TreeStore,
        config: &'a FlashConfig,
        progress: &'a dyn ProgressSink,
        hooks: &'a dyn HookSink,
    ) -> Self {
        Self {
            project_dir: project_dir.into(),
            package_store,
            tree_store,
            config,
            progress,
            hooks,
        }
    }

    fn dep_dir(&self) -> PathBuf {
        self.project_dir.join("node_modules")
    }

    /// `ParseManifest`/`ResolveDepSet` already happened by the time
    /// callers reach here (spec.md §1's lockfile-parser collaborator).
    /// `CheckSnapshot → CheckTreeCache → CheckNetwork → InstallParallel`.
    pub async fn install(&self, dep_set: &DependencySet, lockfile_hash: Option<&str>) -> Result<InstallOutcome, Error> {
        progress::report(self.progress, "start", |s| s.start(dep_set.len() as u64));
        hooks::report(self.hooks, "before_snapshot", |h| h.before_snapshot(dep_set));

        let snapshot_path = snapshot::default_path(&self.project_dir);
        if snapshot_path.exists() && snapshot::is_valid(&snapshot_path, dep_set, lockfile_hash) {
            log::debug!("snapshot at {} matches current dependency set", snapshot_path.display());
            snapshot::restore(&self.project_dir, &snapshot_path)?;
            progress::report(self.progress, "complete", |s| s.complete("restored from snapshot"));
            return Ok(InstallOutcome {
                restored_from_snapshot: true,
                snapshot_path: Some(snapshot_path),
                ..InstallOutcome::from_failures(dep_set.package_ids().collect(), Vec::new())
            });
        }

        if self.tree_store.has(dep_set) {
            log::debug!("tree cache hit for dependency set");
            fs::ensure_dir(self.dep_dir())?;
            self.tree_store.get(dep_set, &self.dep_dir())?;
            let path = self.create_snapshot(dep_set, lockfile_hash);
            return Ok(InstallOutcome {
                restored_from_tree: true,
                snapshot_path: path,
                ..InstallOutcome::from_failures(dep_set.package_ids().collect(), Vec::new())
            });
        }

        if self.config.offline {
            return self.install_from_fallbacks(dep_set, lockfile_hash).await;
        }

        let outcome = self.install_parallel(dep_set).await?;
        if outcome.success {
            let path = self.create_snapshot(dep_set, lockfile_hash);
            self.update_tree_cache(dep_set).await;
            return Ok(InstallOutcome {
                snapshot_path: path,
                ..outcome
            });
        }
        Ok(outcome)
    }

    /// Enumerates currently materialized packages, diffs against
    /// `dep_set`, deletes the removed set, then installs the
    /// added-or-changed set.
    pub async fn sync(&self, dep_set: &DependencySet) -> Result<InstallOutcome, Error> {
        let current = self.materialized_dependency_set();
        let removed = dep_set.removed_from(&current);
        for (name, _) in removed.iter() {
            fs::remove(self.dep_dir().join(name))?;
        }

        let to_install = dep_set.added_or_changed(&current);
        if to_install.is_empty() {
            return Ok(InstallOutcome::from_failures(Vec::new(), Vec::new()));
        }

        self.install_parallel(&to_install).await
    }

    fn materialized_dependency_set(&self) -> DependencySet {
        let dep_dir = self.dep_dir();
        let Ok(entries) = std::fs::read_dir(&dep_dir) else {
            return DependencySet::default();
        };

        let mut pairs = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            let package_json = entry.path().join("package.json");
            if let Ok(raw) = std::fs::read_to_string(&package_json) {
                if let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) {
                    if let Some(version) = value.get("version").and_then(|v| v.as_str()) {
                        pairs.push((name, version.to_string()));
                    }
                }
            }
        }
        DependencySet::from_map(pairs)
    }

    async fn install_parallel(&self, dep_set: &DependencySet) -> Result<InstallOutcome, Error> {
        let concurrency = self.config.concurrency.unwrap_or_else(default_concurrency);
        let pool = WorkerPool::new(concurrency);
        let registry = self.config.registry_url.clone();
        let integrity_check = self.config.integrity_check;
        let dep_dir = self.dep_dir();
        fs::ensure_dir(&dep_dir)?;

        let package_store = self.package_store.clone();
        let pids: Vec<PackageId> = dep_set.package_ids().collect();
        let dep_dir_for_tasks = dep_dir.clone();

        let results = pool
            .run_batch(
                pids.clone(),
                RetryPolicy {
                    max_retries: self.config.max_retries,
                    delay: Duration::from_millis(self.config.retry_delay_ms),
                },
                Duration::from_secs(120),
                move |pid: PackageId| {
                    let store = package_store.clone();
                    let registry = registry.clone();
                    let dest = dep_dir_for_tasks.join(&pid.name);
                    async move { materialize_one(&store, &pid, &registry, &dest, integrity_check).await }
                },
                |_, _err: &TaskError, _attempt| {},
            )
            .await;

        let mut installed = Vec::new();
        let mut failed = Vec::new();
        for (pid, result) in pids.into_iter().zip(results) {
            match result {
                Ok(()) => installed.push(pid),
                Err(err) => {
                    let retryable = matches!(&err, crate::pool::Error::Failed(e) if e.is_retryable());
                    failed.push(PackageFailure {
                        pid: pid.clone(),
                        reason: err.to_string(),
                        retryable,
                    });
                }
            }
        }

        Ok(InstallOutcome::from_failures(installed, failed))
    }

    async fn install_from_fallbacks(&self, dep_set: &DependencySet, _lockfile_hash: Option<&str>) -> Result<InstallOutcome, Error> {
        let snapshot_path = snapshot::default_path(&self.project_dir);
        let resolver = FallbackResolver::new(
            self.package_store,
            snapshot_path.exists().then_some(snapshot_path.as_path()),
            &self.project_dir,
            FallbackFlags {
                allow_version_fallback: self.config.allow_version_fallback,
                use_cache: true,
                use_snapshot: true,
                use_local: true,
            },
        );

        let mut installed = Vec::new();
        let mut failed = Vec::new();
        let dep_dir = self.dep_dir();
        fs::ensure_dir(&dep_dir)?;

        for (pid, result) in resolver.resolve(dep_set) {
            if !result.found {
                failed.push(PackageFailure {
                    pid,
                    reason: "offline and no fallback source satisfied this package".to_string(),
                    retryable: false,
                });
                continue;
            }

            if !result.exact_version {
                log::warn!(
                    "resolved {} at fallback version {} instead of requested {}",
                    pid.name,
                    result.version.as_deref().unwrap_or("?"),
                    pid.version
                );
            }

            let resolved = PackageId::new(pid.name.clone(), result.version.clone().unwrap_or(pid.version.clone()));
            let dest = dep_dir.join(&pid.name);
            match self.package_store.get(&resolved, &dest) {
                Ok(true) => installed.push(pid),
                _ => failed.push(PackageFailure {
                    pid,
                    reason: "fallback source reported a hit but materialization failed".to_string(),
                    retryable: false,
                }),
            }
        }

        Ok(InstallOutcome::from_failures(installed, failed))
    }

    fn create_snapshot(&self, dep_set: &DependencySet, lockfile_hash: Option<&str>) -> Option<PathBuf> {
        let now_ms = chrono::Utc::now().timestamp_millis();
        match snapshot::create(&self.project_dir, dep_set, lockfile_hash.map(str::to_string), None, now_ms) {
            Ok(path) => Some(path),
            Err(err) => {
                log::warn!("snapshot creation failed, install still reported as success: {err}");
                None
            }
        }
    }

    /// Uploads the materialized tree to the tree store on a blocking
    /// task, abandoning (not just warning after the fact) once it runs
    /// past `tree_cache_timeout_secs`.
    async fn update_tree_cache(&self, dep_set: &DependencySet) {
        let timeout = Duration::from_secs(self.config.tree_cache_timeout_secs);
        let dep_dir = self.dep_dir();
        let store = self.tree_store.clone();
        let dep_set = dep_set.clone();

        let task = tokio::task::spawn_blocking(move || store.put(&dep_set, &dep_dir));
        match tokio::time::timeout(timeout, task).await {
            Ok(Ok(Ok(_))) => {}
            Ok(Ok(Err(err))) => log::warn!("tree cache upload failed, snapshot still reported as success: {err}"),
            Ok(Err(join_err)) => log::warn!("tree cache upload task panicked: {join_err}"),
            Err(_elapsed) => log::warn!("tree cache upload exceeded {:?}, snapshot still reported as success", timeout),
        }
    }
}

/// Per-package materialization error. Keeps `fetch::Error`'s retry
/// signal (`is_retryable`) visible to the caller after the worker pool
/// has wrapped it in [`crate::pool::Error`].
#[derive(Debug, Error)]
enum TaskError {
    #[error(transparent)]
    Fetch(#[from] fetch::Error),
    #[error(transparent)]
    Store(#[from] crate::store::Error),
}

impl TaskError {
    fn is_retryable(&self) -> bool {
        matches!(self, TaskError::Fetch(e) if e.is_retryable())
    }
}

/// `StoreHit → copy-from-store` else `fetch → extract → store → place`
/// (spec.md §4.9's per-package materialization rule). `integrity_check`
/// is already enforced inside the store's own `get`/`put`; there is no
/// separate digest to check here since no registry index protocol is
/// implemented.
async fn materialize_one(
    store: &PackageStore,
    pid: &PackageId,
    registry: &str,
    dest: &Path,
    _integrity_check: bool,
) -> Result<(), TaskError> {
    if store.get(pid, dest)? {
        return Ok(());
    }

    let fetched = fetch::fetch(pid, registry, None, |_, _| {}).await?;
    store.put(pid, fetched.path())?;
    store.get(pid, dest)?;
    Ok(())
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism().map(|n| n.get().saturating_sub(1).max(1)).unwrap_or(1)
}

#[cfg(test)]
mod test {
    use super::*;

    fn test_config() -> FlashConfig {
        FlashConfig {
            offline: true,
            ..FlashConfig::default()
        }
    }

    #[tokio::test]
    async fn offline_install_fails_without_fallback_sources() {
        let store_dir = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let config = test_config();

        let package_store = PackageStore::open(store_dir.path(), &config).unwrap();
        let tree_store = TreeStore::open(&store_dir.path().join("trees-root"), &config).unwrap();
        let orchestrator = InstallOrchestrator::new(project.path(), &package_store, &tree_store, &config, &(), &());

        let dep_set = DependencySet::from_map([("lodash".to_string(), "4.17.21".to_string())]);
        let outcome = orchestrator.install(&dep_set, None).await.unwrap();

        assert!(!outcome.success);
        assert_eq!(outcome.failed.len(), 1);
    }

    #[tokio::test]
    async fn offline_install_falls_back_to_cache() {
        let store_dir = tempfile::tempdir().unwrap();
        let project = tempfile::tempdir().unwrap();
        let mut config = test_config();
        config.allow_version_fallback = true;

        let package_store = PackageStore::open(store_dir.path(), &config).unwrap();
        let tree_store = TreeStore::open(&store_dir.path().join("trees-root"), &config).unwrap();

        let pkg_dir = tempfile::tempdir().unwrap();
        std::fs::write(pkg_dir.path().join("package.json"), b"{\"version\":\"4.17.20\"}").unwrap();
        package_store.put(&PackageId::new("lodash", "4.17.20"), pkg_dir.path()).unwrap();

        let orchestrator = InstallOrchestrator::new(project.path(), &package_store, &tree_store, &config, &(), &());
        let dep_set = DependencySet::from_map([("lodash".to_string(), "4.17.21".to_string())]);
        let outcome = orchestrator.install(&dep_set, None).await.unwrap();

        assert!(outcome.success);
        assert_eq!(outcome.installed.len(), 1);
        assert!(project.path().join("node_modules/lodash/package.json").exists());
    }
}
