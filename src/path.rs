//! Path guard: validation and normalization of client-supplied paths.
//!
//! Every path entering the store funnels through this module exactly once,
//! at the operation boundary. After [`validate`] (or [`validate_or_root`])
//! succeeds, [`resolve`] is infallible and the resulting absolute path is
//! guaranteed to stay under the store's base directory.

use crate::error::{FsError, Result};
use std::path::{Path, PathBuf};

/// Maximum accepted path length in bytes.
pub const MAX_PATH_LEN: usize = 4096;

/// Normalize a relative path, rejecting anything unsafe.
///
/// Rules: no NUL bytes, no leading `/`, no `..` components, length capped at
/// [`MAX_PATH_LEN`]. Runs of `/`, trailing `/`, and `.` components collapse
/// away. The result may be empty (the root); callers that need a non-empty
/// path use [`validate`].
fn normalize(path: &str) -> Result<String> {
    if path.len() > MAX_PATH_LEN {
        return Err(FsError::InvalidPath(format!(
            "path exceeds {} bytes",
            MAX_PATH_LEN
        )));
    }
    if path.contains('\0') {
        return Err(FsError::InvalidPath("path contains NUL byte".into()));
    }
    if path.starts_with('/') {
        return Err(FsError::InvalidPath(format!(
            "absolute path not allowed: {}",
            path
        )));
    }

    let mut components = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(FsError::InvalidPath(format!(
                    "parent traversal not allowed: {}",
                    path
                )));
            }
            other => components.push(other),
        }
    }

    Ok(components.join("/"))
}

/// Validate a path that must name an entry (non-empty after normalization).
pub fn validate(path: &str) -> Result<String> {
    let normalized = normalize(path)?;
    if normalized.is_empty() {
        return Err(FsError::InvalidPath("empty path".into()));
    }
    Ok(normalized)
}

/// Validate a path where empty means the store root (list, stat, exists).
pub fn validate_or_root(path: &str) -> Result<String> {
    normalize(path)
}

/// Join a validated relative path onto the base directory.
///
/// Infallible after validation: the components contain no separators, no
/// `..`, and no NULs, so the result cannot escape `base`.
pub fn resolve(base: &Path, validated: &str) -> PathBuf {
    if validated.is_empty() {
        base.to_path_buf()
    } else {
        base.join(validated)
    }
}
