//! Local on-disk store: the deterministic apply target.
//!
//! Every replica owns one `LocalStore` anchored at a configured base
//! directory. All operations validate their paths through the path guard
//! before any syscall and hold the matching per-path lock for their duration,
//! so identical operation sequences produce bytewise-identical trees on every
//! replica.
//!
//! Mutating operations are idempotent where the protocol requires it:
//! creating an entity that already exists with the same kind, or deleting an
//! entity that is already gone, succeeds.

use crate::error::{FsError, Result};
use crate::locker::PathLocker;
use crate::path;
use crate::types::FileInfo;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Maximum size of a single file served by `read_file`.
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;

/// On-disk store rooted at a base directory.
pub struct LocalStore {
    base: PathBuf,
    locker: PathLocker,
}

impl LocalStore {
    /// Open the store, creating the base directory (mode 0755) if needed.
    ///
    /// An existing base that is not a directory is refused.
    pub fn open(base: impl Into<PathBuf>) -> Result<Self> {
        let base = base.into();

        match fs::metadata(&base) {
            Ok(meta) if !meta.is_dir() => {
                return Err(FsError::NotDirectory(base.display().to_string()));
            }
            Ok(_) => {
                info!(base = %base.display(), "store opened at existing directory");
            }
            Err(_) => {
                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(0o755)
                    .create(&base)?;
                info!(base = %base.display(), "store initialized at new directory");
            }
        }

        Ok(Self {
            base,
            locker: PathLocker::new(),
        })
    }

    /// The absolute base directory of this store.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Create an empty file (mode 0644). Creating an existing file succeeds.
    pub fn create_file(&self, rel: &str) -> Result<()> {
        let rel = path::validate(rel)?;
        let _guard = self.locker.write(&rel);
        let full = path::resolve(&self.base, &rel);

        match OpenOptions::new().write(true).create_new(true).open(&full) {
            Ok(_) => {
                debug!(path = %rel, "created file");
                Ok(())
            }
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                // Idempotent only for an entity of the same kind.
                if full.is_dir() {
                    Err(FsError::AlreadyExists(rel))
                } else {
                    debug!(path = %rel, "file already exists");
                    Ok(())
                }
            }
            Err(e) => Err(FsError::from_errno(e, &rel)),
        }
    }

    /// Truncate-write `data` and fsync before returning.
    pub fn write_file(&self, rel: &str, data: &[u8]) -> Result<()> {
        let rel = path::validate(rel)?;
        let _guard = self.locker.write(&rel);
        let full = path::resolve(&self.base, &rel);

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&full)
            .map_err(|e| FsError::from_errno(e, &rel))?;
        file.write_all(data).map_err(|e| FsError::from_errno(e, &rel))?;
        file.sync_all().map_err(|e| FsError::from_errno(e, &rel))?;

        debug!(path = %rel, bytes = data.len(), "wrote file");
        Ok(())
    }

    /// Append `data`, creating the file if absent, and fsync before returning.
    pub fn append_file(&self, rel: &str, data: &[u8]) -> Result<()> {
        let rel = path::validate(rel)?;
        let _guard = self.locker.write(&rel);
        let full = path::resolve(&self.base, &rel);

        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&full)
            .map_err(|e| FsError::from_errno(e, &rel))?;
        file.write_all(data).map_err(|e| FsError::from_errno(e, &rel))?;
        file.sync_all().map_err(|e| FsError::from_errno(e, &rel))?;

        debug!(path = %rel, bytes = data.len(), "appended to file");
        Ok(())
    }

    /// Unlink a file. Deleting a missing file succeeds.
    pub fn delete_file(&self, rel: &str) -> Result<()> {
        let rel = path::validate(rel)?;
        let _guard = self.locker.write(&rel);
        let full = path::resolve(&self.base, &rel);

        if full.is_dir() {
            return Err(FsError::NotDirectory(rel));
        }

        match fs::remove_file(&full) {
            Ok(()) => {
                debug!(path = %rel, "deleted file");
                Ok(())
            }
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                debug!(path = %rel, "file already deleted");
                Ok(())
            }
            Err(e) => Err(FsError::from_errno(e, &rel)),
        }
    }

    /// Create a directory (mode 0755). Creating an existing directory
    /// succeeds.
    pub fn create_directory(&self, rel: &str) -> Result<()> {
        let rel = path::validate(rel)?;
        let _guard = self.locker.write(&rel);
        let full = path::resolve(&self.base, &rel);

        match fs::DirBuilder::new().mode(0o755).create(&full) {
            Ok(()) => {
                debug!(path = %rel, "created directory");
                Ok(())
            }
            Err(e) if e.raw_os_error() == Some(libc::EEXIST) => {
                if full.is_dir() {
                    debug!(path = %rel, "directory already exists");
                    Ok(())
                } else {
                    Err(FsError::AlreadyExists(rel))
                }
            }
            Err(e) => Err(FsError::from_errno(e, &rel)),
        }
    }

    /// Remove an empty directory. Deleting a missing directory succeeds.
    pub fn delete_directory(&self, rel: &str) -> Result<()> {
        let rel = path::validate(rel)?;
        let _guard = self.locker.write(&rel);
        let full = path::resolve(&self.base, &rel);

        match fs::remove_dir(&full) {
            Ok(()) => {
                debug!(path = %rel, "deleted directory");
                Ok(())
            }
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => {
                debug!(path = %rel, "directory already deleted");
                Ok(())
            }
            Err(e) => Err(FsError::from_errno(e, &rel)),
        }
    }

    /// Rename `from` to `to` via rename(2). Not idempotent.
    pub fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = path::validate(from)?;
        let to = path::validate(to)?;
        let _guards = self.locker.write_pair(&from, &to);

        let full_from = path::resolve(&self.base, &from);
        let full_to = path::resolve(&self.base, &to);

        fs::rename(&full_from, &full_to).map_err(|e| FsError::from_errno(e, &from))?;
        debug!(from = %from, to = %to, "renamed");
        Ok(())
    }

    /// Read a whole file, capped at [`MAX_FILE_SIZE`].
    pub fn read_file(&self, rel: &str) -> Result<Vec<u8>> {
        let rel = path::validate(rel)?;
        let _guard = self.locker.read(&rel);
        let full = path::resolve(&self.base, &rel);

        let mut file = File::open(&full).map_err(|e| FsError::from_errno(e, &rel))?;
        let meta = file.metadata().map_err(|e| FsError::from_errno(e, &rel))?;

        if meta.is_dir() {
            return Err(FsError::NotDirectory(rel));
        }
        if meta.len() > MAX_FILE_SIZE {
            return Err(FsError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("file {} exceeds {} byte limit", rel, MAX_FILE_SIZE),
            )));
        }

        let mut data = Vec::with_capacity(meta.len() as usize);
        file.read_to_end(&mut data)
            .map_err(|e| FsError::from_errno(e, &rel))?;

        debug!(path = %rel, bytes = data.len(), "read file");
        Ok(data)
    }

    /// List a directory. Entries come back sorted by name, `.` and `..`
    /// excluded, each with its [`FileInfo`].
    ///
    /// The directory itself is write-locked to fence off a concurrent rename
    /// or create of the listed directory; its entries are not locked.
    pub fn list_directory(&self, rel: &str) -> Result<Vec<FileInfo>> {
        let rel = path::validate_or_root(rel)?;
        let _guard = self.locker.write(&rel);
        let full = path::resolve(&self.base, &rel);

        let reader = fs::read_dir(&full).map_err(|e| FsError::from_errno(e, &rel))?;
        let mut entries = Vec::new();
        for entry in reader {
            let entry = entry.map_err(|e| FsError::from_errno(e, &rel))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let meta = entry.metadata().map_err(|e| FsError::from_errno(e, &rel))?;
            entries.push(FileInfo::from_metadata(name, &meta));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        debug!(path = %rel, count = entries.len(), "listed directory");
        Ok(entries)
    }

    /// Stat a path. The empty path stats the store root.
    pub fn stat(&self, rel: &str) -> Result<FileInfo> {
        let rel = path::validate_or_root(rel)?;
        let _guard = self.locker.read(&rel);
        let full = path::resolve(&self.base, &rel);

        let meta = fs::metadata(&full).map_err(|e| FsError::from_errno(e, &rel))?;
        let name = rel.rsplit('/').next().unwrap_or("").to_string();
        Ok(FileInfo::from_metadata(name, &meta))
    }

    /// Check whether a path exists. Never errors for a missing path.
    pub fn exists(&self, rel: &str) -> Result<bool> {
        let rel = path::validate_or_root(rel)?;
        let _guard = self.locker.read(&rel);
        let full = path::resolve(&self.base, &rel);

        match fs::metadata(&full) {
            Ok(_) => Ok(true),
            Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(false),
            Err(e) => Err(FsError::from_errno(e, &rel)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Status;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, LocalStore) {
        let dir = tempdir().unwrap();
        let store = LocalStore::open(dir.path().join("tree")).unwrap();
        (dir, store)
    }

    #[test]
    fn open_rejects_non_directory_base() {
        let dir = tempdir().unwrap();
        let file_path = dir.path().join("occupied");
        fs::write(&file_path, b"x").unwrap();
        assert!(LocalStore::open(&file_path).is_err());
    }

    #[test]
    fn create_file_is_idempotent() {
        let (_dir, store) = store();
        store.create_file("a.txt").unwrap();
        store.create_file("a.txt").unwrap();
        assert!(store.exists("a.txt").unwrap());
    }

    #[test]
    fn create_file_over_directory_fails() {
        let (_dir, store) = store();
        store.create_directory("d").unwrap();
        let err = store.create_file("d").unwrap_err();
        assert_eq!(err.status(), Status::AlreadyExists);
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, store) = store();
        store.write_file("data.bin", b"hello world").unwrap();
        assert_eq!(store.read_file("data.bin").unwrap(), b"hello world");

        // Truncating overwrite
        store.write_file("data.bin", b"hi").unwrap();
        assert_eq!(store.read_file("data.bin").unwrap(), b"hi");
    }

    #[test]
    fn write_with_missing_parent_fails() {
        let (_dir, store) = store();
        let err = store.write_file("missing/f", b"x").unwrap_err();
        assert_eq!(err.status(), Status::FileNotFound);
    }

    #[test]
    fn append_accumulates() {
        let (_dir, store) = store();
        store.create_file("log").unwrap();
        store.append_file("log", b"a\n").unwrap();
        store.append_file("log", b"b\n").unwrap();
        assert_eq!(store.read_file("log").unwrap(), b"a\nb\n");
    }

    #[test]
    fn empty_payload_write_and_append() {
        let (_dir, store) = store();
        store.write_file("empty", b"").unwrap();
        assert_eq!(store.read_file("empty").unwrap(), b"");
        assert_eq!(store.stat("empty").unwrap().size_bytes, 0);

        store.append_file("empty", b"").unwrap();
        assert_eq!(store.read_file("empty").unwrap(), b"");
    }

    #[test]
    fn delete_file_is_idempotent() {
        let (_dir, store) = store();
        store.create_file("gone").unwrap();
        store.delete_file("gone").unwrap();
        store.delete_file("gone").unwrap();
        assert!(!store.exists("gone").unwrap());
    }

    #[test]
    fn delete_file_on_directory_fails() {
        let (_dir, store) = store();
        store.create_directory("d").unwrap();
        let err = store.delete_file("d").unwrap_err();
        assert_eq!(err.status(), Status::NotDirectory);
    }

    #[test]
    fn delete_directory_semantics() {
        let (_dir, store) = store();
        store.create_directory("d").unwrap();
        store.create_file("d/f").unwrap();

        let err = store.delete_directory("d").unwrap_err();
        assert_eq!(err.status(), Status::DirectoryNotEmpty);

        store.delete_file("d/f").unwrap();
        store.delete_directory("d").unwrap();
        store.delete_directory("d").unwrap(); // idempotent
    }

    #[test]
    fn rename_moves_content() {
        let (_dir, store) = store();
        store.write_file("a", b"data").unwrap();
        store.rename("a", "b").unwrap();

        let err = store.read_file("a").unwrap_err();
        assert_eq!(err.status(), Status::FileNotFound);
        assert_eq!(store.read_file("b").unwrap(), b"data");
    }

    #[test]
    fn rename_missing_source_fails() {
        let (_dir, store) = store();
        let err = store.rename("nope", "other").unwrap_err();
        assert_eq!(err.status(), Status::FileNotFound);
    }

    #[test]
    fn list_directory_sorted_without_dot_entries() {
        let (_dir, store) = store();
        store.create_directory("proj").unwrap();
        store.create_file("proj/b").unwrap();
        store.create_file("proj/a").unwrap();
        store.create_directory("proj/sub").unwrap();

        let entries = store.list_directory("proj").unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "sub"]);
        assert!(entries[2].is_directory);
    }

    #[test]
    fn list_root_with_empty_path() {
        let (_dir, store) = store();
        store.create_file("top").unwrap();
        let entries = store.list_directory("").unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "top");
    }

    #[test]
    fn list_missing_directory_fails() {
        let (_dir, store) = store();
        let err = store.list_directory("absent").unwrap_err();
        assert_eq!(err.status(), Status::FileNotFound);
    }

    #[test]
    fn stat_reports_kind_and_size() {
        let (_dir, store) = store();
        store.write_file("f", b"12345").unwrap();
        store.create_directory("d").unwrap();

        let info = store.stat("f").unwrap();
        assert_eq!(info.name, "f");
        assert_eq!(info.size_bytes, 5);
        assert!(!info.is_directory);
        assert!(info.last_modified > 0);

        let info = store.stat("d").unwrap();
        assert!(info.is_directory);
        assert_eq!(info.size_bytes, 0);

        let err = store.stat("missing").unwrap_err();
        assert_eq!(err.status(), Status::FileNotFound);
    }

    #[test]
    fn guard_rejects_before_any_syscall() {
        let (_dir, store) = store();
        for bad in ["../escape", "/abs", "a\0b"] {
            let err = store.write_file(bad, b"x").unwrap_err();
            assert_eq!(err.status(), Status::InvalidPath);
        }
        // Nothing was created under the base.
        assert!(store.list_directory("").unwrap().is_empty());
    }

    #[test]
    fn identical_sequences_produce_identical_trees() {
        let dir = tempdir().unwrap();
        let s1 = LocalStore::open(dir.path().join("one")).unwrap();
        let s2 = LocalStore::open(dir.path().join("two")).unwrap();

        for store in [&s1, &s2] {
            store.create_directory("a").unwrap();
            store.write_file("a/f", b"v1").unwrap();
            store.append_file("a/f", b"+v2").unwrap();
            store.create_file("a/g").unwrap();
            store.rename("a/g", "a/h").unwrap();
            store.delete_file("a/h").unwrap();
        }

        let l1 = s1.list_directory("a").unwrap();
        let l2 = s2.list_directory("a").unwrap();
        assert_eq!(
            l1.iter().map(|e| (&e.name, e.size_bytes)).collect::<Vec<_>>(),
            l2.iter().map(|e| (&e.name, e.size_bytes)).collect::<Vec<_>>()
        );
        assert_eq!(s1.read_file("a/f").unwrap(), s2.read_file("a/f").unwrap());
    }
}
