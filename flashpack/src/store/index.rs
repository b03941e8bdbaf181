//! The store's metadata index: a single JSON file mapping `hash ->
//! entry`, backed in memory by a [`DashMap`] so concurrent `has`/`get`
//! reads never block each other while writes still serialize through
//! [`crate::fs::atomic_replace`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::CompressionFormat;
use crate::fs;
use crate::manifest::PackageId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("fs error: {0}")]
    Fs(#[from] fs::Error),
    #[error("failed to parse metadata index at {path}: {source}")]
    Parse { path: PathBuf, source: serde_json::Error },
    #[error("failed to serialize metadata index: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Which on-disk subtree a hash's entry was stored under. Needed
/// because `metadata.json` is a single flat map covering both package
/// and tree entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    Packages,
    Trees,
}

impl Bucket {
    pub fn dir_name(self) -> &'static str {
        match self {
            Bucket::Packages => "packages",
            Bucket::Trees => "trees",
        }
    }
}

/// One record in the package or tree store (spec.md §3's `StoreEntry`
/// / `TreeEntry`, unified since they share a shape). `pid` is `Some` for
/// package-bucket entries (letting the fallback resolver enumerate which
/// versions of a name are cached) and `None` for tree-bucket entries,
/// which have no single package identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub bucket: Bucket,
    pub hash: String,
    pub pid: Option<PackageId>,
    pub stored_at: DateTime<Utc>,
    pub size: u64,
    pub original_size: Option<u64>,
    pub compressed: bool,
    pub compression_format: Option<CompressionFormat>,
    pub compression_level: Option<u32>,
    pub integrity_hash: Option<String>,
}

impl Entry {
    /// Filename extension the compressed archive uses on disk, matching
    /// `<store>/{packages,trees}/<xx>/<hash>.<ext>`.
    pub fn extension(&self) -> Option<&'static str> {
        match self.compression_format {
            Some(CompressionFormat::Gzip) => Some("gz"),
            Some(CompressionFormat::Brotli) => Some("br"),
            None => None,
        }
    }
}

/// Shared, file-backed metadata index at `<store>/metadata.json`.
#[derive(Debug, Clone)]
pub struct MetadataIndex {
    path: PathBuf,
    entries: Arc<DashMap<String, Entry>>,
}

impl MetadataIndex {
    pub fn open(store_root: &Path) -> Result<Self, Error> {
        let path = store_root.join("metadata.json");
        let entries = if path.exists() {
            let raw = std::fs::read_to_string(&path).map_err(|source| fs::Error::Io {
                path: path.clone(),
                source,
            })?;
            let map: std::collections::HashMap<String, Entry> = serde_json::from_str(&raw).map_err(|source| Error::Parse {
                path: path.clone(),
                source,
            })?;
            map.into_iter().collect()
        } else {
            DashMap::new()
        };

        Ok(Self {
            path,
            entries: Arc::new(entries),
        })
    }

    pub fn get(&self, hash: &str) -> Option<Entry> {
        self.entries.get(hash).map(|e| e.clone())
    }

    pub fn insert(&self, entry: Entry) -> Result<(), Error> {
        self.entries.insert(entry.hash.clone(), entry);
        self.persist()
    }

    /// Insert only if absent, returning whether this call won the race.
    /// Used by `put` to converge concurrent writers on one entry.
    pub fn insert_if_absent(&self, entry: Entry) -> Result<bool, Error> {
        let inserted = match self.entries.entry(entry.hash.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(entry);
                true
            }
        };
        if inserted {
            self.persist()?;
        }
        Ok(inserted)
    }

    pub fn remove(&self, hash: &str) -> Option<Entry> {
        let removed = self.entries.remove(hash).map(|(_, entry)| entry);
        if removed.is_some() {
            let _ = self.persist();
        }
        removed
    }

    pub fn retain<F>(&self, mut keep: F)
    where
        F: FnMut(&Entry) -> bool,
    {
        self.entries.retain(|_, entry| keep(entry));
        let _ = self.persist();
    }

    pub fn iter(&self) -> Vec<Entry> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    pub fn clear(&self) -> Result<(), Error> {
        self.entries.clear();
        self.persist()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    fn persist(&self) -> Result<(), Error> {
        let snapshot: std::collections::HashMap<String, Entry> =
            self.entries.iter().map(|e| (e.key().clone(), e.value().clone())).collect();
        let serialized = serde_json::to_vec_pretty(&snapshot)?;
        fs::atomic_replace(&self.path, &serialized)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn sample_entry(hash: &str) -> Entry {
        Entry {
            bucket: Bucket::Packages,
            hash: hash.to_string(),
            pid: None,
            stored_at: Utc::now(),
            size: 100,
            original_size: None,
            compressed: false,
            compression_format: None,
            compression_level: None,
            integrity_hash: None,
        }
    }

    #[test]
    fn persists_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let index = MetadataIndex::open(dir.path()).unwrap();
        index.insert(sample_entry("abc")).unwrap();

        let reopened = MetadataIndex::open(dir.path()).unwrap();
        assert!(reopened.get("abc").is_some());
    }

    #[test]
    fn insert_if_absent_converges_on_one_entry() {
        let dir = tempfile::tempdir().unwrap();
        let index = MetadataIndex::open(dir.path()).unwrap();

        let first = index.insert_if_absent(sample_entry("dup")).unwrap();
        let second = index.insert_if_absent(sample_entry("dup")).unwrap();

        assert!(first);
        assert!(!second);
        assert_eq!(index.len(), 1);
    }
}
