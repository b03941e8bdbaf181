//! Resolve a tarball URL, download, verify and extract — the registry
//! fetcher (C3). Grounded in `moss::package::fetch` and
//! `moss::client::cache`'s fetch/unpack split, adapted from moss's
//! custom `.stone` payload format to a plain gzip tarball fetched over
//! HTTP, which is what an npm-style registry actually serves.

use std::io;
use std::path::{Path, PathBuf};

use futures_util::StreamExt;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

use crate::fs;
use crate::manifest::PackageId;

#[derive(Debug, Error)]
pub enum Error {
    #[error("network error fetching {0}: {1}")]
    Network(String, reqwest::Error),
    #[error("package not found: {0}")]
    NotFound(PackageId),
    #[error("archive extraction failed for {0}: {1}")]
    Extract(PackageId, io::Error),
    #[error("integrity mismatch for {pid}: expected {expected}, got {actual}")]
    Integrity {
        pid: PackageId,
        expected: String,
        actual: String,
    },
    #[error("invalid url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Per-package errors the worker pool should retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Network(..))
    }
}

/// Builds the tarball URL for `pid` against `registry_base`, matching
/// `<registry>/<urlencode(name)>/-/<name>-<version>.tgz`.
pub fn tarball_url(registry_base: &str, pid: &PackageId) -> Result<url::Url, Error> {
    let encoded_name = urlencoding::encode(&pid.name);
    let raw = format!(
        "{}/{}/-/{}-{}.tgz",
        registry_base.trim_end_matches('/'),
        encoded_name,
        pid.name,
        pid.version
    );
    Ok(url::Url::parse(&raw)?)
}

/// A package whose tarball has been downloaded and extracted into an
/// owned staging directory. The caller (the store or orchestrator)
/// decides where it ultimately lives; dropping this value without
/// promoting it leaves nothing behind because the directory is owned by
/// a [`tempfile::TempDir`].
pub struct FetchedPackage {
    dir: tempfile::TempDir,
}

impl FetchedPackage {
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Hands ownership of the staging directory to the caller, who is
    /// now responsible for moving or removing it.
    pub fn into_path(self) -> PathBuf {
        self.dir.into_path()
    }
}

/// Downloads and extracts `pid`'s tarball. Steps follow spec.md §4.3:
/// stream to a temp file, extract into a staging dir while stripping the
/// tarball's single leading path component (the `package/` prefix npm
/// tarballs use), then hand back the staging directory. The temp
/// tarball is removed on every exit path via `tempfile::NamedTempFile`'s
/// drop glue.
pub async fn fetch(
    pid: &PackageId,
    registry_base: &str,
    expected_digest: Option<&str>,
    mut on_progress: impl FnMut(u64, Option<u64>),
) -> Result<FetchedPackage, Error> {
    let url = tarball_url(registry_base, pid)?;

    let response = reqwest::get(url)
        .await
        .map_err(|e| Error::Network(pid.to_string(), e))?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(Error::NotFound(pid.clone()));
    }
    let response = response
        .error_for_status()
        .map_err(|e| Error::Network(pid.to_string(), e))?;

    let total = response.content_length();
    let mut tarball = tokio::fs::File::from_std(
        tempfile::NamedTempFile::new()
            .map_err(Error::Io)?
            .into_file(),
    );

    let mut stream = response.bytes_stream();
    let mut downloaded = 0u64;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| Error::Network(pid.to_string(), e))?;
        downloaded += chunk.len() as u64;
        tarball.write_all(&chunk).await?;
        on_progress(downloaded, total);
    }
    tarball.flush().await?;

    let tarball_path = {
        use std::io::Seek;
        let mut std_file = tarball.into_std().await;
        std_file.seek(std::io::SeekFrom::Start(0))?;
        std_file
    };

    let staging = tempfile::tempdir().map_err(Error::Io)?;
    extract_stripping_root(tarball_path, staging.path()).map_err(|e| Error::Extract(pid.clone(), e))?;

    if let Some(expected) = expected_digest {
        let actual = crate::store::compression::hash_tree(staging.path()).map_err(Error::Io)?;
        if actual != expected {
            return Err(Error::Integrity {
                pid: pid.clone(),
                expected: expected.to_string(),
                actual,
            });
        }
    }

    Ok(FetchedPackage { dir: staging })
}

/// Extracts a gzip tarball into `dest`, stripping the single leading
/// path component every entry shares (npm tarballs nest everything
/// under `package/`).
fn extract_stripping_root(tarball: std::fs::File, dest: &Path) -> io::Result<()> {
    fs::ensure_dir(dest).map_err(to_io)?;

    let decoder = flate2::read::GzDecoder::new(tarball);
    let mut archive = tar::Archive::new(decoder);
    archive.set_preserve_permissions(true);

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        let mut components = path.components();
        components.next(); // drop the leading `package/` (or similar) component
        let stripped: PathBuf = components.collect();
        if stripped.as_os_str().is_empty() {
            continue;
        }
        let target = dest.join(stripped);
        if let Some(parent) = target.parent() {
            fs::ensure_dir(parent).map_err(to_io)?;
        }
        entry.unpack(&target)?;
    }

    Ok(())
}

fn to_io(e: fs::Error) -> io::Error {
    match e {
        fs::Error::Io { source, .. } => source,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tarball_url_matches_npm_convention() {
        let pid = PackageId::new("lodash", "4.17.21");
        let url = tarball_url("https://registry.npmjs.org", &pid).unwrap();
        assert_eq!(
            url.as_str(),
            "https://registry.npmjs.org/lodash/-/lodash-4.17.21.tgz"
        );
    }

    #[test]
    fn tarball_url_encodes_scoped_package_names() {
        let pid = PackageId::new("@types/node", "20.0.0");
        let url = tarball_url("https://registry.npmjs.org", &pid).unwrap();
        assert!(url.as_str().starts_with("https://registry.npmjs.org/%40types%2Fnode/-/"));
    }

    #[test]
    fn extract_stripping_root_drops_leading_component() {
        use std::io::Write as _;

        let tar_gz = tempfile::NamedTempFile::new().unwrap();
        {
            let encoder = flate2::write::GzEncoder::new(tar_gz.reopen().unwrap(), flate2::Compression::default());
            let mut builder = tar::Builder::new(encoder);
            let mut header = tar::Header::new_gnu();
            let data = b"{\"name\":\"demo\"}";
            header.set_size(data.len() as u64);
            header.set_cksum();
            builder
                .append_data(&mut header, "package/package.json", &data[..])
                .unwrap();
            builder.into_inner().unwrap().finish().unwrap();
        }

        let dest = tempfile::tempdir().unwrap();
        extract_stripping_root(tar_gz.reopen().unwrap(), dest.path()).unwrap();

        assert!(dest.path().join("package.json").exists());
        assert!(!dest.path().join("package").exists());
    }
}
