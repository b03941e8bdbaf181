//! The single owned entry point through which every component is
//! reached (SPEC_FULL.md §4.10). Named and shaped after
//! `moss::installation::Installation`/`moss::client::Client`: resolves
//! a store root, ensures the on-disk layout, probes write access, and
//! hands out borrowed component handles — never a free-standing global.

use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::config::{self, FlashConfig};
use crate::fs;
use crate::hooks::HookSink;
use crate::manifest::{DependencySet, PackageId};
use crate::orchestrator::{self, InstallOrchestrator, InstallOutcome};
use crate::progress::ProgressSink;
use crate::store::{self, PackageStore, TreeStore};

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error(transparent)]
    Fs(#[from] fs::Error),
    #[error(transparent)]
    Store(#[from] store::Error),
    #[error(transparent)]
    Orchestrator(#[from] orchestrator::Error),
    #[error("store root {0} is not writable")]
    ReadOnly(PathBuf),
}

/// Whether this process can write to the store root. Mirrors
/// `moss::installation::Mutability`, minus the system-vs-user-tree
/// distinction moss needs and this engine does not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    ReadWrite,
    ReadOnly,
}

/// Owns the resolved configuration, both stores, and the sinks every
/// install/restore/sync call is made through.
pub struct Engine {
    config: FlashConfig,
    package_store: PackageStore,
    tree_store: TreeStore,
    mutability: Mutability,
    progress: Box<dyn ProgressSink>,
    hooks: Box<dyn HookSink>,
}

impl Engine {
    /// Resolves `root` (falling back to [`config::default_store_root`]
    /// if `None`), ensures `packages/`, `trees/` and `metadata.json`
    /// exist, and probes write access.
    pub fn open(root: Option<&Path>, config: FlashConfig) -> Result<Self, Error> {
        let root = root.map(Path::to_path_buf).unwrap_or_else(config::default_store_root);
        fs::ensure_dir(&root)?;

        let mutability = probe_mutability(&root);
        log::trace!("store root {} resolved as {:?}", root.display(), mutability);

        let package_store = PackageStore::open(&root, &config)?;
        let tree_store = TreeStore::open(&root, &config)?;

        if mutability == Mutability::ReadWrite {
            if let Ok(serialized) = serde_json::to_vec_pretty(&config) {
                let _ = fs::atomic_replace(root.join("config.json"), &serialized);
            }
        }

        Ok(Self {
            config,
            package_store,
            tree_store,
            mutability,
            progress: Box::new(()),
            hooks: Box::new(()),
        })
    }

    pub fn with_progress(mut self, sink: impl ProgressSink + 'static) -> Self {
        self.progress = Box::new(sink);
        self
    }

    pub fn with_hooks(mut self, sink: impl HookSink + 'static) -> Self {
        self.hooks = Box::new(sink);
        self
    }

    pub fn mutability(&self) -> Mutability {
        self.mutability
    }

    pub fn config(&self) -> &FlashConfig {
        &self.config
    }

    pub fn package_store(&self) -> &PackageStore {
        &self.package_store
    }

    pub fn tree_store(&self) -> &TreeStore {
        &self.tree_store
    }

    fn require_writable(&self, project_dir: &Path) -> Result<(), Error> {
        if self.mutability == Mutability::ReadOnly {
            return Err(Error::ReadOnly(project_dir.to_path_buf()));
        }
        Ok(())
    }

    pub async fn install(
        &self,
        project_dir: &Path,
        dep_set: &DependencySet,
        lockfile_hash: Option<&str>,
    ) -> Result<InstallOutcome, Error> {
        self.require_writable(project_dir)?;
        let orchestrator = InstallOrchestrator::new(
            project_dir,
            &self.package_store,
            &self.tree_store,
            &self.config,
            self.progress.as_ref(),
            self.hooks.as_ref(),
        );
        Ok(orchestrator.install(dep_set, lockfile_hash).await?)
    }

    pub async fn sync(&self, project_dir: &Path, dep_set: &DependencySet) -> Result<InstallOutcome, Error> {
        self.require_writable(project_dir)?;
        let orchestrator = InstallOrchestrator::new(
            project_dir,
            &self.package_store,
            &self.tree_store,
            &self.config,
            self.progress.as_ref(),
            self.hooks.as_ref(),
        );
        Ok(orchestrator.sync(dep_set).await?)
    }

    pub fn has_package(&self, pid: &PackageId) -> bool {
        self.package_store.has(pid)
    }
}

fn probe_mutability(root: &Path) -> Mutability {
    let probe = root.join(format!(".write-probe.{}", std::process::id()));
    match std::fs::write(&probe, b"") {
        Ok(()) => {
            let _ = std::fs::remove_file(&probe);
            Mutability::ReadWrite
        }
        Err(_) => Mutability::ReadOnly,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn open_creates_layout_and_reports_writable() {
        let root = tempfile::tempdir().unwrap();
        let engine = Engine::open(Some(root.path()), FlashConfig::default()).unwrap();

        assert_eq!(engine.mutability(), Mutability::ReadWrite);
        assert!(root.path().join("packages").is_dir());
        assert!(root.path().join("trees").is_dir());
    }
}
