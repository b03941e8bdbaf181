//! Tar-based archival plus gzip/brotli compression for store entries,
//! and the content-hash used both as the optional integrity hash
//! (spec.md §4.4) and as the internal dedup key for `optimize()`.

use std::io::{self, Read, Write};
use std::path::Path;

use sha1::Sha1;
use sha2::{Digest, Sha256};
use thiserror::Error;
use walkdir::WalkDir;

use crate::config::CompressionFormat;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Packs `src_dir` into a tar stream and compresses it with `format` at
/// `level`, writing the result to `dst_file`. Returns the compressed
/// size in bytes.
pub fn compress_dir(src_dir: &Path, dst_file: &Path, format: CompressionFormat, level: u32) -> Result<u64, Error> {
    let out = std::fs::File::create(dst_file)?;

    match format {
        CompressionFormat::Gzip => {
            let encoder = flate2::write::GzEncoder::new(out, flate2::Compression::new(level));
            let mut builder = tar::Builder::new(encoder);
            builder.append_dir_all(".", src_dir)?;
            let encoder = builder.into_inner()?;
            encoder.finish()?;
        }
        CompressionFormat::Brotli => {
            let mut tar_bytes = Vec::new();
            {
                let mut builder = tar::Builder::new(&mut tar_bytes);
                builder.append_dir_all(".", src_dir)?;
                builder.finish()?;
            }
            let mut writer = io::BufWriter::new(out);
            let params = brotli::enc::BrotliEncoderParams {
                quality: level.min(11) as i32,
                ..Default::default()
            };
            brotli::BrotliCompress(&mut tar_bytes.as_slice(), &mut writer, &params)?;
            writer.flush()?;
        }
    }

    Ok(std::fs::metadata(dst_file)?.len())
}

/// Streams `src_file` (as produced by [`compress_dir`]) back out into
/// `dst_dir`.
pub fn decompress_dir(src_file: &Path, dst_dir: &Path, format: CompressionFormat) -> Result<(), Error> {
    std::fs::create_dir_all(dst_dir)?;
    let input = std::fs::File::open(src_file)?;

    match format {
        CompressionFormat::Gzip => {
            let decoder = flate2::read::GzDecoder::new(input);
            let mut archive = tar::Archive::new(decoder);
            archive.unpack(dst_dir)?;
        }
        CompressionFormat::Brotli => {
            let mut reader = io::BufReader::new(input);
            let mut tar_bytes = Vec::new();
            brotli::BrotliDecompress(&mut reader, &mut tar_bytes)?;
            let mut archive = tar::Archive::new(tar_bytes.as_slice());
            archive.unpack(dst_dir)?;
        }
    }

    Ok(())
}

/// `SHA256(concat over sorted files of (relative_path_bytes || file_contents))`,
/// the integrity hash defined in spec.md §4.4.
pub fn hash_tree(dir: &Path) -> io::Result<String> {
    let mut paths: Vec<_> = WalkDir::new(dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().strip_prefix(dir).unwrap().to_path_buf())
        .collect();
    paths.sort();

    let mut hasher = Sha256::new();
    for rel in paths {
        hasher.update(rel.to_string_lossy().as_bytes());
        let mut file = std::fs::File::open(dir.join(&rel))?;
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-1 over a single file's bytes. Used only as an internal dedup key
/// by `optimize()`, not as a trust boundary.
pub fn hash_file_sha1(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha1::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}
