//! Content-addressed path mapping.
//! A key is never used as a filename directly: it is hashed (SHA-1) and the
//! hex digest is split into a shallow directory tree so no single directory
//! accumulates thousands of entries.

use std::path::PathBuf;

use sha1::{Digest, Sha1};

/// Hex characters per directory level. A 40-char SHA-1 digest yields
/// 40 / 5 = 8 nested levels.
const SEGMENT_LEN: usize = 5;

/// On-disk location derived from a key: a nested directory path plus the
/// full digest as the filename. The directory segments are a prefix
/// partition of the filename.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CasPath {
    /// Nested directory portion, e.g. `68044/29f74/181a6/...`.
    pub path: String,
    /// Full 40-char lowercase hex digest.
    pub filename: String,
}

impl CasPath {
    /// Directory portion joined with the filename, relative to the
    /// store root and node id.
    pub fn full_path(&self) -> PathBuf {
        PathBuf::from(&self.path).join(&self.filename)
    }

    /// First directory segment. Deleting this subtree removes every blob
    /// whose digest shares the same leading segment.
    pub fn first_dir(&self) -> &str {
        self.path.split('/').next().unwrap_or("")
    }
}

/// Map a key to its content-addressed location.
/// Deterministic across machines; performs no I/O.
pub fn cas_path(key: &str) -> CasPath {
    let digest = Sha1::digest(key.as_bytes());
    let hash = hex::encode(digest);

    let segments: Vec<&str> = hash
        .as_bytes()
        .chunks(SEGMENT_LEN)
        .map(|c| std::str::from_utf8(c).unwrap_or(""))
        .collect();

    CasPath {
        path: segments.join("/"),
        filename: hash,
    }
}
