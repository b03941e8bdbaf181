//! Atomic copy/link/remove, recursive size and streaming I/O.
//!
//! Every write into the store or a snapshot goes through
//! [`atomic_replace`]: the payload is written into a sibling temp path
//! and renamed into place, so partial state is never observable under
//! the final name.

use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error at {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

impl Error {
    fn at(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Idempotent directory creation. Fails only on a genuine permission error.
pub fn ensure_dir(path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    match fs_err::create_dir_all(path) {
        Ok(()) => Ok(()),
        Err(source) => Err(Error::at(path, source)),
    }
}

/// Recursive delete. Idempotent on a missing path.
pub fn remove(path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    let meta = match fs_err::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(source) if source.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(source) => return Err(Error::at(path, source)),
    };

    let result = if meta.is_dir() {
        fs_err::remove_dir_all(path)
    } else {
        fs_err::remove_file(path)
    };

    match result {
        Ok(()) => Ok(()),
        Err(source) if source.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(Error::at(path, source)),
    }
}

/// Sum of file sizes of live descendants. Symlinks are not followed.
pub fn size(path: impl AsRef<Path>) -> Result<u64, Error> {
    let path = path.as_ref();
    let meta = match fs_err::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(source) if source.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(source) => return Err(Error::at(path, source)),
    };

    if meta.is_symlink() {
        return Ok(0);
    }
    if meta.is_file() {
        return Ok(meta.len());
    }

    let mut total = 0;
    for entry in all_files(path)? {
        total += fs_err::symlink_metadata(&entry)
            .map_err(|source| Error::at(&entry, source))?
            .len();
    }
    Ok(total)
}

/// A finite, non-restartable sequence of regular-file paths under `path`.
/// Order is unspecified but stable within one call.
pub fn all_files(path: impl AsRef<Path>) -> Result<Vec<PathBuf>, Error> {
    let path = path.as_ref();
    let mut out = Vec::new();
    for entry in WalkDir::new(path).into_iter() {
        let entry = entry.map_err(|e| {
            Error::at(
                e.path().unwrap_or(path).to_path_buf(),
                io::Error::new(io::ErrorKind::Other, e),
            )
        })?;
        if entry.file_type().is_file() {
            out.push(entry.path().to_path_buf());
        }
    }
    Ok(out)
}

/// Recursive copy from `src` to `dst`.
///
/// When `prefer_hardlink` is set, regular files become hardlinks if
/// `src` and `dst` share a device; on cross-device or unsupported
/// filesystems this falls back to streaming copy transparently.
/// Executable bits are preserved; symlinks are preserved as symlinks,
/// never dereferenced.
pub fn copy(
    src: impl AsRef<Path>,
    dst: impl AsRef<Path>,
    prefer_hardlink: bool,
    mut progress: Option<&mut dyn FnMut(u64)>,
) -> Result<(), Error> {
    copy_inner(src.as_ref(), dst.as_ref(), prefer_hardlink, &mut progress)
}

fn copy_inner(
    src: &Path,
    dst: &Path,
    prefer_hardlink: bool,
    progress: &mut Option<&mut dyn FnMut(u64)>,
) -> Result<(), Error> {
    let meta = fs_err::symlink_metadata(src).map_err(|source| Error::at(src, source))?;

    if meta.is_symlink() {
        let target = fs_err::read_link(src).map_err(|source| Error::at(src, source))?;
        if let Some(parent) = dst.parent() {
            ensure_dir(parent)?;
        }
        let _ = fs_err::remove_file(dst);
        std::os::unix::fs::symlink(&target, dst).map_err(|source| Error::at(dst, source))?;
        return Ok(());
    }

    if meta.is_dir() {
        ensure_dir(dst)?;
        for entry in fs_err::read_dir(src).map_err(|source| Error::at(src, source))? {
            let entry = entry.map_err(|source| Error::at(src, source))?;
            let child_dst = dst.join(entry.file_name());
            copy_inner(&entry.path(), &child_dst, prefer_hardlink, progress)?;
        }
        return Ok(());
    }

    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }

    let mut linked = false;
    if prefer_hardlink {
        let _ = fs_err::remove_file(dst);
        match fs_err::hard_link(src, dst) {
            Ok(()) => linked = true,
            Err(source) if source.raw_os_error() == Some(libc_exdev()) => {}
            Err(source) if source.kind() == io::ErrorKind::Unsupported => {}
            Err(source) => return Err(Error::at(dst, source)),
        }
    }

    if !linked {
        stream_copy(src, dst, progress)?;
    }

    let perms = meta.permissions();
    if perms.mode() & 0o111 != 0 {
        let mut dst_perms = fs_err::metadata(dst)
            .map_err(|source| Error::at(dst, source))?
            .permissions();
        dst_perms.set_mode(perms.mode());
        fs_err::set_permissions(dst, dst_perms).map_err(|source| Error::at(dst, source))?;
    }

    Ok(())
}

fn stream_copy(src: &Path, dst: &Path, progress: &mut Option<&mut dyn FnMut(u64)>) -> Result<(), Error> {
    use std::io::{Read, Write};

    let mut reader = fs_err::File::open(src).map_err(|source| Error::at(src, source))?;
    let mut writer = fs_err::File::create(dst).map_err(|source| Error::at(dst, source))?;

    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf).map_err(|source| Error::at(src, source))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .map_err(|source| Error::at(dst, source))?;
        if let Some(cb) = progress.as_mut() {
            cb(n as u64);
        }
    }
    Ok(())
}

/// `ENXDEV` ("cross-device link"), the errno hardlink creation fails
/// with when `src`/`dst` live on different filesystems.
fn libc_exdev() -> i32 {
    18
}

/// Returns `true` if `a` and `b` live on the same device, used to decide
/// whether a hardlink is even worth attempting.
pub fn same_device(a: impl AsRef<Path>, b: impl AsRef<Path>) -> bool {
    let dev = |p: &Path| fs_err::metadata(p).ok().map(|m| m.dev());
    match (dev(a.as_ref()), dev(b.as_ref())) {
        (Some(x), Some(y)) => x == y,
        _ => false,
    }
}

/// Write `contents` to a sibling temp path next to `dst` and rename it
/// into place. Partial state is never observable under `dst`.
pub fn atomic_replace(dst: impl AsRef<Path>, contents: &[u8]) -> Result<(), Error> {
    let dst = dst.as_ref();
    let parent = dst.parent().unwrap_or_else(|| Path::new("."));
    ensure_dir(parent)?;

    let tmp_name = format!(
        ".{}.{}.tmp",
        dst.file_name().and_then(|n| n.to_str()).unwrap_or("entry"),
        std::process::id()
    );
    let tmp = parent.join(tmp_name);

    fs_err::write(&tmp, contents).map_err(|source| Error::at(&tmp, source))?;
    fs_err::rename(&tmp, dst).map_err(|source| Error::at(dst, source))?;
    Ok(())
}

/// Rename `src` into `dst`, falling back to a remove-then-rename if a
/// directory already occupies `dst` (mirrors the "skip if present"
/// commit pattern used by concurrent `put`s into the store).
pub fn atomic_rename_dir(src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<(), Error> {
    let (src, dst) = (src.as_ref(), dst.as_ref());
    if let Some(parent) = dst.parent() {
        ensure_dir(parent)?;
    }
    match fs_err::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(source) if dst.exists() => {
            // Another writer committed first; our copy is redundant.
            let _ = remove(src);
            let _ = source;
            Ok(())
        }
        Err(source) => Err(Error::at(dst, source)),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs::File;
    use std::io::Write as _;

    #[test]
    fn copy_preserves_executable_bit() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();

        let file_path = src.path().join("run.sh");
        let mut f = File::create(&file_path).unwrap();
        writeln!(f, "#!/bin/sh").unwrap();
        let mut perms = f.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        fs_err::set_permissions(&file_path, perms).unwrap();

        let dst_path = dst.path().join("run.sh");
        copy(&file_path, &dst_path, false, None).unwrap();

        let dst_mode = fs_err::metadata(&dst_path).unwrap().permissions().mode();
        assert_eq!(dst_mode & 0o111, 0o111);
    }

    #[test]
    fn copy_preserves_symlinks() {
        let src = tempfile::tempdir().unwrap();
        let dst = tempfile::tempdir().unwrap();

        let target = src.path().join("target.txt");
        fs_err::write(&target, b"hi").unwrap();
        let link = src.path().join("link.txt");
        std::os::unix::fs::symlink(&target, &link).unwrap();

        let dst_link = dst.path().join("link.txt");
        copy(&link, &dst_link, false, None).unwrap();

        assert!(fs_err::symlink_metadata(&dst_link).unwrap().file_type().is_symlink());
    }

    #[test]
    fn remove_is_idempotent_on_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        remove(&missing).unwrap();
        remove(&missing).unwrap();
    }

    #[test]
    fn size_sums_regular_files_only() {
        let dir = tempfile::tempdir().unwrap();
        fs_err::write(dir.path().join("a.txt"), b"1234").unwrap();
        fs_err::create_dir(dir.path().join("sub")).unwrap();
        fs_err::write(dir.path().join("sub/b.txt"), b"12345678").unwrap();

        assert_eq!(size(dir.path()).unwrap(), 12);
    }

    #[test]
    fn atomic_replace_leaves_no_partial_file_on_success() {
        let dir = tempfile::tempdir().unwrap();
        let dst = dir.path().join("metadata.json");
        atomic_replace(&dst, b"{}").unwrap();
        assert_eq!(fs_err::read(&dst).unwrap(), b"{}");

        let leftovers: Vec<_> = fs_err::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
