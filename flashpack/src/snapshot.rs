//! Snapshot engine (C6): a single-file archive of a project's
//! materialized dependency directory plus the fingerprint that proves
//! it matches a given dependency set. Grounded in `moss::client::cache`'s
//! archive-write-then-atomic-commit shape, adapted to the three
//! self-contained formats spec.md §6.1 names instead of moss's `.stone`
//! container.

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::fs;
use crate::manifest::DependencySet;

const DEFAULT_FILE_NAME: &str = ".flashpack";
const METADATA_ENTRY: &str = ".flashpack-metadata.json";
const DEPENDENCY_DIR: &str = "node_modules";

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("fs error: {0}")]
    Fs(#[from] fs::Error),
    #[error("unsupported snapshot format for {0}")]
    UnsupportedFormat(PathBuf),
    #[error("malformed snapshot metadata in {0}: {1}")]
    MalformedMetadata(PathBuf, serde_json::Error),
    #[error("snapshot missing metadata entry: {0}")]
    MissingMetadata(PathBuf),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    #[serde(rename = "tar.gz")]
    TarGz,
    Tar,
    Zip,
}

impl Format {
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_string_lossy();
        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            Some(Format::TarGz)
        } else if name.ends_with(".tar") {
            Some(Format::Tar)
        } else if name.ends_with(".zip") {
            Some(Format::Zip)
        } else {
            // No recognized suffix: default archives (bare `.flashpack`) are tar.gz.
            Some(Format::TarGz)
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Format::TarGz => "tar.gz",
            Format::Tar => "tar",
            Format::Zip => "zip",
        }
    }
}

/// Identity record carried alongside the dependency set inside a
/// snapshot archive (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fingerprint {
    pub tree_hash: String,
    pub lockfile_hash: Option<String>,
    pub created_at: i64,
}

impl Fingerprint {
    pub fn new(dep_set: &DependencySet, lockfile_hash: Option<String>, created_at: i64) -> Self {
        Self {
            tree_hash: dep_set.tree_hash(),
            lockfile_hash,
            created_at,
        }
    }

    /// Two fingerprints match iff `tree_hash` agrees; if both sides carry
    /// a `lockfile_hash`, that must agree too.
    pub fn matches(&self, other: &Fingerprint) -> bool {
        if self.tree_hash != other.tree_hash {
            return false;
        }
        match (&self.lockfile_hash, &other.lockfile_hash) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetadataFile {
    dependencies: std::collections::BTreeMap<String, String>,
    timestamp: i64,
    format: Format,
    fingerprint: Fingerprint,
}

/// The parsed contents of a snapshot's metadata entry.
#[derive(Debug, Clone)]
pub struct Metadata {
    pub dep_set: DependencySet,
    pub fingerprint: Fingerprint,
    pub format: Format,
}

pub fn default_path(project: &Path) -> PathBuf {
    project.join(DEFAULT_FILE_NAME)
}

/// Creates a snapshot archive at `out_path` (default `<project>/.flashpack`)
/// containing the project's `node_modules` plus fingerprint metadata.
pub fn create(
    project: &Path,
    dep_set: &DependencySet,
    lockfile_hash: Option<String>,
    out_path: Option<&Path>,
    now_ms: i64,
) -> Result<PathBuf, Error> {
    let path = out_path.map(Path::to_path_buf).unwrap_or_else(|| default_path(project));
    let format = Format::from_path(&path).unwrap_or(Format::TarGz);

    let metadata = MetadataFile {
        dependencies: dep_set.iter().map(|(n, v)| (n.to_string(), v.to_string())).collect(),
        timestamp: now_ms,
        format,
        fingerprint: Fingerprint::new(dep_set, lockfile_hash, now_ms),
    };
    let metadata_json = serde_json::to_vec_pretty(&metadata).map_err(|e| Error::MalformedMetadata(path.clone(), e))?;

    let dep_dir = project.join(DEPENDENCY_DIR);
    let tmp_path = path.with_extension(format!("{}.tmp", std::process::id()));

    match format {
        Format::TarGz => write_tar(&tmp_path, &dep_dir, &metadata_json, Some(6))?,
        Format::Tar => write_tar(&tmp_path, &dep_dir, &metadata_json, None)?,
        Format::Zip => write_zip(&tmp_path, &dep_dir, &metadata_json, 6)?,
    }

    fs::atomic_rename_dir(&tmp_path, &path)?;
    Ok(path)
}

fn write_tar(dst: &Path, dep_dir: &Path, metadata_json: &[u8], gzip_level: Option<u32>) -> Result<(), Error> {
    let out = File::create(dst)?;

    match gzip_level {
        Some(level) => {
            let encoder = flate2::write::GzEncoder::new(out, flate2::Compression::new(level));
            let mut builder = tar::Builder::new(encoder);
            append_snapshot_entries(&mut builder, dep_dir, metadata_json)?;
            builder.into_inner()?.finish()?;
        }
        None => {
            let mut builder = tar::Builder::new(out);
            append_snapshot_entries(&mut builder, dep_dir, metadata_json)?;
            builder.into_inner()?;
        }
    }

    Ok(())
}

fn append_snapshot_entries<W: Write>(builder: &mut tar::Builder<W>, dep_dir: &Path, metadata_json: &[u8]) -> io::Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_size(metadata_json.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, METADATA_ENTRY, metadata_json)?;

    if dep_dir.exists() {
        for path in fs::all_files(dep_dir).map_err(fs_to_io)? {
            let rel = path.strip_prefix(dep_dir.parent().unwrap_or(dep_dir)).unwrap_or(&path);
            let name = rel.to_string_lossy().replace('\\', "/");
            // Skip nested `node_modules/*/node_modules`: only depth-2 entries survive.
            if name.matches("node_modules").count() > 1 {
                continue;
            }
            builder.append_path_with_name(&path, &name)?;
        }
    }
    Ok(())
}

fn fs_to_io(e: fs::Error) -> io::Error {
    match e {
        fs::Error::Io { source, .. } => source,
    }
}

fn write_zip(dst: &Path, dep_dir: &Path, metadata_json: &[u8], level: i64) -> Result<(), Error> {
    let out = File::create(dst)?;
    let mut zip = zip::ZipWriter::new(out);
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .compression_level(Some(level));

    zip.start_file(METADATA_ENTRY, options).map_err(to_io)?;
    zip.write_all(metadata_json)?;

    if dep_dir.exists() {
        for path in fs::all_files(dep_dir)? {
            let rel = path.strip_prefix(dep_dir.parent().unwrap_or(dep_dir)).unwrap_or(&path);
            let name = rel.to_string_lossy().replace('\\', "/");
            // Skip nested `node_modules/*/node_modules`: only depth-2 entries survive.
            if name.matches("node_modules").count() > 1 {
                continue;
            }
            zip.start_file(&name, options).map_err(to_io)?;
            let mut f = File::open(&path)?;
            io::copy(&mut f, &mut zip)?;
        }
    }

    zip.finish().map_err(to_io)?;
    Ok(())
}

/// Opens `path`, extracts only the metadata entry, and parses it.
pub fn metadata(path: &Path) -> Result<Metadata, Error> {
    let format = Format::from_path(path).ok_or_else(|| Error::UnsupportedFormat(path.to_path_buf()))?;
    let raw = read_metadata_entry(path, format)?;
    let parsed: MetadataFile = serde_json::from_slice(&raw).map_err(|e| Error::MalformedMetadata(path.to_path_buf(), e))?;

    Ok(Metadata {
        dep_set: DependencySet::from_map(parsed.dependencies),
        fingerprint: parsed.fingerprint,
        format: parsed.format,
    })
}

fn read_metadata_entry(path: &Path, format: Format) -> Result<Vec<u8>, Error> {
    match format {
        Format::TarGz | Format::Tar => {
            let file = File::open(path)?;
            let mut archive = match format {
                Format::TarGz => tar::Archive::new(Box::new(flate2::read::GzDecoder::new(file)) as Box<dyn Read>),
                _ => tar::Archive::new(Box::new(file) as Box<dyn Read>),
            };
            for entry in archive.entries()? {
                let mut entry = entry?;
                if entry.path()?.to_string_lossy() == METADATA_ENTRY {
                    let mut buf = Vec::new();
                    entry.read_to_end(&mut buf)?;
                    return Ok(buf);
                }
            }
            Err(Error::MissingMetadata(path.to_path_buf()))
        }
        Format::Zip => {
            let file = File::open(path)?;
            let mut archive = zip::ZipArchive::new(file).map_err(to_io)?;
            let mut entry = archive.by_name(METADATA_ENTRY).map_err(|_| Error::MissingMetadata(path.to_path_buf()))?;
            let mut buf = Vec::new();
            entry.read_to_end(&mut buf)?;
            Ok(buf)
        }
    }
}

/// Returns true iff the archive's fingerprint matches `dep_set` (and the
/// lockfile hash, if both sides carry one).
pub fn is_valid(path: &Path, dep_set: &DependencySet, lockfile_hash: Option<&str>) -> bool {
    let Ok(meta) = metadata(path) else { return false };
    if meta.dep_set != *dep_set {
        return false;
    }
    let current = Fingerprint {
        tree_hash: dep_set.tree_hash(),
        lockfile_hash: lockfile_hash.map(str::to_string),
        created_at: meta.fingerprint.created_at,
    };
    meta.fingerprint.matches(&current)
}

/// Extracts the archive into `project`, removing an existing dependency
/// directory first. Does not consult the package or tree store.
pub fn restore(project: &Path, path: &Path) -> Result<(), Error> {
    let format = Format::from_path(path).ok_or_else(|| Error::UnsupportedFormat(path.to_path_buf()))?;
    let dep_dir = project.join(DEPENDENCY_DIR);
    fs::remove(&dep_dir)?;

    match format {
        Format::TarGz => {
            let file = File::open(path)?;
            let decoder = flate2::read::GzDecoder::new(file);
            tar::Archive::new(decoder).unpack(project)?;
        }
        Format::Tar => {
            let file = File::open(path)?;
            tar::Archive::new(file).unpack(project)?;
        }
        Format::Zip => {
            let file = File::open(path)?;
            let mut archive = zip::ZipArchive::new(file).map_err(to_io)?;
            archive.extract(project).map_err(to_io)?;
        }
    }

    Ok(())
}

fn to_io(e: zip::result::ZipError) -> Error {
    Error::Io(io::Error::new(io::ErrorKind::Other, e))
}
