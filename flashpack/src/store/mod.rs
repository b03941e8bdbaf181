//! Content-addressed store shared by the package store (C4) and tree
//! store (C5): one on-disk layout, one metadata index, compression and
//! dedup machinery common to both. `PackageStore` and `TreeStore` are
//! thin wrappers that supply the hashing and put/get layout semantics
//! spec.md §4.4/§4.5 distinguish.

pub mod compression;
pub mod index;
pub mod package;
pub mod tree;

pub use index::{Bucket, Entry};
pub use package::PackageStore;
pub use tree::TreeStore;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::{CompressionFormat, FlashConfig};
use crate::fs;
use crate::manifest::PackageId;
use index::MetadataIndex;

#[derive(Debug, Error)]
pub enum Error {
    #[error("fs error: {0}")]
    Fs(#[from] fs::Error),
    #[error("index error: {0}")]
    Index(#[from] index::Error),
    #[error("compression error: {0}")]
    Compression(#[from] compression::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Default)]
pub struct StoreStats {
    pub entries: usize,
    pub size: u64,
    pub packages: usize,
    pub trees: usize,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
    pub avg_size: f64,
}

const COMPRESS_THRESHOLD_BYTES: u64 = 10 * 1024;
const OPTIMIZE_COMPRESS_THRESHOLD_BYTES: u64 = 50 * 1024;
const OPTIMIZE_DEDUP_MIN_FILE_BYTES: u64 = 4 * 1024;
const VERIFY_SIZE_DRIFT_RATIO: f64 = 0.10;

/// Shared cache backing both buckets. Opened once per store root and
/// cloned cheaply (the index is `Arc`-backed internally).
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
    index: MetadataIndex,
    hardlink: bool,
    compression_enabled: bool,
    compression_format: CompressionFormat,
    compression_level: u32,
    integrity_check: bool,
}

impl Store {
    pub fn open(root: &Path, config: &FlashConfig) -> Result<Self, Error> {
        fs::ensure_dir(root)?;
        fs::ensure_dir(root.join("packages"))?;
        fs::ensure_dir(root.join("trees"))?;
        let index = MetadataIndex::open(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            index,
            hardlink: config.hardlink,
            compression_enabled: config.compression_enabled,
            compression_format: config.compression_format,
            compression_level: config.compression_level,
            integrity_check: config.integrity_check,
        })
    }

    fn entry_dir(&self, bucket: Bucket, hash: &str) -> PathBuf {
        self.root.join(bucket.dir_name()).join(&hash[0..2])
    }

    fn uncompressed_path(&self, bucket: Bucket, hash: &str) -> PathBuf {
        self.entry_dir(bucket, hash).join(hash)
    }

    fn compressed_path(&self, bucket: Bucket, hash: &str, ext: &str) -> PathBuf {
        self.entry_dir(bucket, hash).join(format!("{hash}.{ext}"))
    }

    fn entry_path(&self, entry: &Entry) -> PathBuf {
        match entry.extension() {
            Some(ext) => self.compressed_path(entry.bucket, &entry.hash, ext),
            None => self.uncompressed_path(entry.bucket, &entry.hash),
        }
    }

    pub fn has(&self, hash: &str) -> bool {
        self.index.get(hash).is_some()
    }

    /// Every cached `PackageId` whose name is `name`, across the package
    /// bucket only — used by the fallback resolver to find a compatible
    /// version when the exact one requested isn't cached.
    pub fn pids_by_name(&self, name: &str) -> Vec<PackageId> {
        self.index
            .iter()
            .into_iter()
            .filter(|e| e.bucket == Bucket::Packages)
            .filter_map(|e| e.pid)
            .filter(|pid| pid.name == name)
            .collect()
    }

    /// Materializes `hash`'s stored content at `dst_dir`. Returns `false`
    /// without writing anything if the hash is unknown or its on-disk
    /// representation has gone missing.
    fn get_into(&self, hash: &str, dst_dir: &Path) -> Result<bool, Error> {
        let Some(entry) = self.index.get(hash) else {
            return Ok(false);
        };
        let path = self.entry_path(&entry);
        if !path.exists() {
            log::warn!("store entry {hash} is indexed but missing on disk at {}", path.display());
            return Ok(false);
        }

        fs::ensure_dir(dst_dir)?;
        if let Some(format) = entry.compression_format {
            compression::decompress_dir(&path, dst_dir, format)?;
        } else {
            fs::copy(&path, dst_dir, self.hardlink, None)?;
        }

        if self.integrity_check {
            if let Some(expected) = &entry.integrity_hash {
                let actual = compression::hash_tree(dst_dir)?;
                if &actual != expected {
                    log::warn!("integrity mismatch restoring {hash}: expected {expected}, got {actual}");
                }
            }
        }

        Ok(true)
    }

    /// Stores `src_dir` under `hash` if absent. A concurrent `put` for
    /// the same hash converges on one entry via the staging-then-rename
    /// commit and the index's insert-if-absent. `pid` is `Some` for a
    /// package-bucket entry, `None` for a tree-bucket entry.
    fn put_from(&self, bucket: Bucket, hash: &str, pid: Option<PackageId>, src_dir: &Path) -> Result<bool, Error> {
        if self.index.get(hash).is_some() {
            return Ok(false);
        }

        let size = fs::size(src_dir)?;
        let dir = self.entry_dir(bucket, hash);
        fs::ensure_dir(&dir)?;

        let integrity_hash = if self.integrity_check {
            Some(compression::hash_tree(src_dir)?)
        } else {
            None
        };

        let should_compress = self.compression_enabled && size > COMPRESS_THRESHOLD_BYTES;

        let entry = if should_compress {
            let ext = extension_for(self.compression_format);
            let staging = dir.join(format!(".{hash}.{}.{ext}.tmp", std::process::id()));
            let dest = self.compressed_path(bucket, hash, ext);
            let compressed_size = compression::compress_dir(src_dir, &staging, self.compression_format, self.compression_level)?;
            fs::atomic_rename_dir(&staging, &dest)?;

            Entry {
                bucket,
                hash: hash.to_string(),
                pid: pid.clone(),
                stored_at: Utc::now(),
                size: compressed_size,
                original_size: Some(size),
                compressed: true,
                compression_format: Some(self.compression_format),
                compression_level: Some(self.compression_level),
                integrity_hash,
            }
        } else {
            let staging = dir.join(format!(".{hash}.{}.tmp", std::process::id()));
            fs::copy(src_dir, &staging, self.hardlink, None)?;
            let dest = self.uncompressed_path(bucket, hash);
            fs::atomic_rename_dir(&staging, &dest)?;

            Entry {
                bucket,
                hash: hash.to_string(),
                pid: pid.clone(),
                stored_at: Utc::now(),
                size,
                original_size: None,
                compressed: false,
                compression_format: None,
                compression_level: None,
                integrity_hash,
            }
        };

        Ok(self.index.insert_if_absent(entry)?)
    }

    pub fn stats(&self) -> StoreStats {
        let entries = self.index.iter();
        if entries.is_empty() {
            return StoreStats::default();
        }

        let packages = entries.iter().filter(|e| e.bucket == Bucket::Packages).count();
        let trees = entries.iter().filter(|e| e.bucket == Bucket::Trees).count();
        let size: u64 = entries.iter().map(|e| e.size).sum();
        let oldest = entries.iter().map(|e| e.stored_at).min();
        let newest = entries.iter().map(|e| e.stored_at).max();

        StoreStats {
            entries: entries.len(),
            size,
            packages,
            trees,
            oldest,
            newest,
            avg_size: size as f64 / entries.len() as f64,
        }
    }

    pub fn clean(&self, max_age: StdDuration) -> Result<usize, Error> {
        let age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - age;

        let mut removed = 0;
        for entry in self.index.iter() {
            if entry.stored_at < cutoff {
                fs::remove(self.entry_path(&entry))?;
                self.index.remove(&entry.hash);
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn verify(&self) -> Result<usize, Error> {
        let mut removed = 0;
        for entry in self.index.iter() {
            let path = self.entry_path(&entry);
            let missing = !path.exists();
            let drifted = !missing
                && entry.size > 0
                && {
                    let measured = fs::size(&path)?;
                    (measured as f64 - entry.size as f64).abs() / entry.size as f64 > VERIFY_SIZE_DRIFT_RATIO
                };

            if missing || drifted {
                self.index.remove(&entry.hash);
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Two-pass optimization (spec.md §4.4): compress large uncompressed
    /// entries, then hardlink-dedup identical files across what remains
    /// uncompressed. Caller must hold exclusive access to this store.
    pub fn optimize(&self) -> Result<u64, Error> {
        let mut saved = 0u64;

        let compress_candidates: Vec<Entry> = self
            .index
            .iter()
            .into_iter()
            .filter(|e| !e.compressed && e.size > OPTIMIZE_COMPRESS_THRESHOLD_BYTES)
            .collect();

        for entry in compress_candidates {
            let src = self.uncompressed_path(entry.bucket, &entry.hash);
            let ext = extension_for(self.compression_format);
            let dst = self.compressed_path(entry.bucket, &entry.hash, ext);
            let compressed_size = compression::compress_dir(&src, &dst, self.compression_format, self.compression_level)?;

            if compressed_size < entry.size {
                saved += entry.size - compressed_size;
                fs::remove(&src)?;
                self.index.insert(Entry {
                    size: compressed_size,
                    original_size: Some(entry.size),
                    compressed: true,
                    compression_format: Some(self.compression_format),
                    compression_level: Some(self.compression_level),
                    ..entry
                })?;
            } else {
                fs::remove(&dst)?;
            }
        }

        if self.hardlink {
            saved += self.dedup_identical_files()?;
        }

        Ok(saved)
    }

    fn dedup_identical_files(&self) -> Result<u64, Error> {
        let mut saved = 0u64;
        let mut seen: HashMap<String, PathBuf> = HashMap::new();

        let uncompressed: Vec<Entry> = self.index.iter().into_iter().filter(|e| !e.compressed).collect();
        for entry in uncompressed {
            let dir = self.uncompressed_path(entry.bucket, &entry.hash);
            let Ok(files) = fs::all_files(&dir) else { continue };

            for file in files {
                let Ok(meta) = std::fs::metadata(&file) else { continue };
                if meta.len() < OPTIMIZE_DEDUP_MIN_FILE_BYTES {
                    continue;
                }
                let Ok(digest) = compression::hash_file_sha1(&file) else { continue };

                match seen.get(&digest) {
                    Some(original) if original != &file => {
                        let _ = std::fs::remove_file(&file);
                        match std::fs::hard_link(original, &file) {
                            Ok(()) => saved += meta.len(),
                            Err(_) => {
                                let _ = std::fs::copy(original, &file);
                            }
                        }
                    }
                    _ => {
                        seen.insert(digest, file);
                    }
                }
            }
        }

        Ok(saved)
    }

    pub fn clear_all(&self) -> Result<(), Error> {
        fs::remove(self.root.join("packages"))?;
        fs::remove(self.root.join("trees"))?;
        fs::ensure_dir(self.root.join("packages"))?;
        fs::ensure_dir(self.root.join("trees"))?;
        self.index.clear()?;
        Ok(())
    }
}

fn extension_for(format: CompressionFormat) -> &'static str {
    match format {
        CompressionFormat::Gzip => "gz",
        CompressionFormat::Brotli => "br",
    }
}
