//! Tree store (C5): archive-level cache keyed by a whole dependency
//! set's `tree_hash`, storing a flat copy of the root dependency
//! directory's top-level entries (spec.md §4.5).

use std::path::Path;
use std::time::Duration;

use crate::config::FlashConfig;
use crate::fs;
use crate::manifest::DependencySet;

use super::index::Bucket;
use super::{Error, Store, StoreStats};

#[derive(Debug, Clone)]
pub struct TreeStore {
    store: Store,
}

impl TreeStore {
    pub fn open(root: &Path, config: &FlashConfig) -> Result<Self, Error> {
        Ok(Self {
            store: Store::open(root, config)?,
        })
    }

    pub fn has(&self, dep_set: &DependencySet) -> bool {
        self.store.has(&dep_set.tree_hash())
    }

    /// Copies `src_root`'s top-level entries into a staging directory,
    /// skipping hidden entries and any entry named the same as
    /// `src_root` itself, then commits the filtered copy into the store.
    pub fn put(&self, dep_set: &DependencySet, src_root: &Path) -> Result<bool, Error> {
        let staging = tempfile::tempdir()?;
        let root_name = src_root.file_name();

        for entry in std::fs::read_dir(src_root)? {
            let entry = entry?;
            let name = entry.file_name();
            if name.to_string_lossy().starts_with('.') {
                continue;
            }
            if Some(name.as_os_str()) == root_name {
                continue;
            }

            let dst = staging.path().join(&name);
            fs::copy(entry.path(), &dst, false, None)?;
        }

        self.store.put_from(Bucket::Trees, &dep_set.tree_hash(), None, staging.path())
    }

    /// Restores the stored tree into `dst_root`, preserving the original
    /// top-level layout.
    pub fn get(&self, dep_set: &DependencySet, dst_root: &Path) -> Result<bool, Error> {
        self.store.get_into(&dep_set.tree_hash(), dst_root)
    }

    pub fn stats(&self) -> StoreStats {
        self.store.stats()
    }

    pub fn clean(&self, max_age: Duration) -> Result<usize, Error> {
        self.store.clean(max_age)
    }

    pub fn verify(&self) -> Result<usize, Error> {
        self.store.verify()
    }

    pub fn optimize(&self) -> Result<u64, Error> {
        self.store.optimize()
    }

    pub fn clear_all(&self) -> Result<(), Error> {
        self.store.clear_all()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn put_skips_hidden_entries_and_round_trips() {
        let store_dir = tempfile::tempdir().unwrap();
        let config = FlashConfig::default();
        let store = TreeStore::open(store_dir.path(), &config).unwrap();

        let src = tempfile::tempdir().unwrap();
        std::fs::create_dir(src.path().join("lodash")).unwrap();
        std::fs::write(src.path().join("lodash/package.json"), b"{\"version\":\"4.17.21\"}").unwrap();
        std::fs::write(src.path().join(".hidden"), b"skip me").unwrap();

        let dep_set = DependencySet::from_map([("lodash".to_string(), "4.17.21".to_string())]);
        assert!(store.put(&dep_set, src.path()).unwrap());
        assert!(store.has(&dep_set));

        let dst = tempfile::tempdir().unwrap();
        assert!(store.get(&dep_set, dst.path()).unwrap());
        assert!(dst.path().join("lodash/package.json").exists());
        assert!(!dst.path().join(".hidden").exists());
    }
}
