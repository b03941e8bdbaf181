//! Package store (C4): content-addressed cache of individual packages,
//! keyed by `pid_hash`.

use std::path::Path;
use std::time::Duration;

use crate::config::FlashConfig;
use crate::manifest::PackageId;

use super::index::Bucket;
use super::{Error, Store, StoreStats};

#[derive(Debug, Clone)]
pub struct PackageStore {
    store: Store,
}

impl PackageStore {
    pub fn open(root: &Path, config: &FlashConfig) -> Result<Self, Error> {
        Ok(Self {
            store: Store::open(root, config)?,
        })
    }

    pub fn has(&self, pid: &PackageId) -> bool {
        self.store.has(&pid.hash())
    }

    /// Idempotent: a no-op returning `false` if `pid` is already stored.
    pub fn put(&self, pid: &PackageId, src_dir: &Path) -> Result<bool, Error> {
        self.store.put_from(Bucket::Packages, &pid.hash(), Some(pid.clone()), src_dir)
    }

    /// Every version of `name` currently cached, in no particular order.
    pub fn versions_for(&self, name: &str) -> Vec<String> {
        self.store.pids_by_name(name).into_iter().map(|pid| pid.version).collect()
    }

    pub fn get(&self, pid: &PackageId, dst_dir: &Path) -> Result<bool, Error> {
        self.store.get_into(&pid.hash(), dst_dir)
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
    fn put_is_idempotent_and_get_round_trips() {
        let store_dir = tempfile::tempdir().unwrap();
        let config = FlashConfig::default();
        let store = PackageStore::open(store_dir.path(), &config).unwrap();

        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("index.js"), b"module.exports = {};").unwrap();

        let pid = PackageId::new("left-pad", "1.3.0");
        assert!(!store.has(&pid));
        assert!(store.put(&pid, src.path()).unwrap());
        assert!(!store.put(&pid, src.path()).unwrap());
        assert!(store.has(&pid));

        let dst = tempfile::tempdir().unwrap();
        assert!(store.get(&pid, dst.path()).unwrap());
        assert_eq!(
            std::fs::read(dst.path().join("index.js")).unwrap(),
            b"module.exports = {};"
        );
    }

    #[test]
    fn large_package_is_compressed_and_round_trips() {
        let store_dir = tempfile::tempdir().unwrap();
        let config = FlashConfig::default();
        let store = PackageStore::open(store_dir.path(), &config).unwrap();

        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("blob.bin"), vec![9u8; 200 * 1024]).unwrap();

        let pid = PackageId::new("big-pkg", "1.0.0");
        store.put(&pid, src.path()).unwrap();

        let hash = pid.hash();
        let shard = &hash[0..2];
        let compressed = store_dir.path().join("packages").join(shard).join(format!("{hash}.gz"));
        let uncompressed = store_dir.path().join("packages").join(shard).join(&hash);
        assert!(compressed.exists());
        assert!(!uncompressed.exists());

        let dst = tempfile::tempdir().unwrap();
        store.get(&pid, dst.path()).unwrap();
        assert_eq!(std::fs::metadata(dst.path().join("blob.bin")).unwrap().len(), 200 * 1024);
    }

    #[test]
    fn stats_reflects_stored_entries() {
        let store_dir = tempfile::tempdir().unwrap();
        let config = FlashConfig::default();
        let store = PackageStore::open(store_dir.path(), &config).unwrap();

        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("a.txt"), b"hi").unwrap();
        store.put(&PackageId::new("a", "1.0.0"), src.path()).unwrap();

        let stats = store.stats();
        assert_eq!(stats.entries, 1);
        assert_eq!(stats.packages, 1);
        assert_eq!(stats.trees, 0);
    }
}
