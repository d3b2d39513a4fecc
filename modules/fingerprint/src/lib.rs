//! Content fingerprints used as deduplication keys by the availability
//! check, plus full digests for files pulled back from the service.

use md5::{Digest, Md5};
use owl_core::{ClientError, Result};
use sha2::Sha256;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

/// What a fingerprint is computed over.
#[derive(Debug, Clone, Copy)]
pub enum Source<'a> {
    /// Observable text; case-insensitive.
    Observable(&'a str),
    Binary(&'a [u8]),
    /// Path to a file read fully into memory.
    File(&'a Path),
}

pub fn fingerprint(source: Source<'_>) -> Result<String> {
    match source {
        Source::Observable(value) => Ok(observable_fingerprint(value)),
        Source::Binary(bytes) => Ok(binary_fingerprint(bytes)),
        Source::File(path) => file_fingerprint(path),
    }
}

pub fn observable_fingerprint(value: &str) -> String {
    binary_fingerprint(value.to_lowercase().as_bytes())
}

pub fn binary_fingerprint(bytes: &[u8]) -> String {
    hex::encode(Md5::digest(bytes))
}

pub fn file_fingerprint(path: &Path) -> Result<String> {
    let bytes = read_file(path)?;
    Ok(binary_fingerprint(&bytes))
}

/// Reads a file for submission or fingerprinting, mapping a missing path to
/// `NotFound`.
pub fn read_file(path: &Path) -> Result<Vec<u8>> {
    if !path.exists() {
        return Err(ClientError::NotFound { path: path.to_path_buf() });
    }
    std::fs::read(path)
        .map_err(|e| ClientError::Validation(format!("cannot read {}: {e}", path.display())))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub path: PathBuf,
    pub size: u64,
    pub md5: String,
    pub sha256: String,
}

/// Streams a file through md5 and sha256 without holding it in memory.
pub fn digest_file(path: &Path) -> Result<FileDigest> {
    if !path.exists() {
        return Err(ClientError::NotFound { path: path.to_path_buf() });
    }
    let io_err =
        |e: std::io::Error| ClientError::Validation(format!("cannot read {}: {e}", path.display()));
    let f = File::open(path).map_err(io_err)?;
    let size = f.metadata().map_err(io_err)?.len();
    let mut reader = BufReader::new(f);
    let mut md5 = Md5::new();
    let mut sha = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).map_err(io_err)?;
        if n == 0 {
            break;
        }
        md5.update(&buf[..n]);
        sha.update(&buf[..n]);
    }
    Ok(FileDigest {
        path: path.to_path_buf(),
        size,
        md5: hex::encode(md5.finalize()),
        sha256: hex::encode(sha.finalize()),
    })
}
