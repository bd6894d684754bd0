//! Writable upper layer rooted at a real directory.
//!
//! Every mutation the union accepts lands here as ordinary files and
//! directories, so the layer survives unmount and remount unchanged. All
//! paths are validated relative paths; nothing here can reach outside
//! the layer root.

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::trace;

use crate::error::VfsError;
use crate::object::EntryKind;
use crate::tree::split_path;

/// Metadata of one upper-layer entry.
#[derive(Debug, Clone)]
pub struct UpperNode {
    /// Entry kind.
    pub kind: EntryKind,
    /// Permission bits.
    pub perm: u32,
    /// Byte length; zero for directories.
    pub size: u64,
    /// Last modification time.
    pub mtime: SystemTime,
}

/// Filesystem-backed writable layer.
#[derive(Debug)]
pub struct UpperLayer {
    root: PathBuf,
    /// Root-level entry hidden from listings (the deletion record
    /// directory lives inside the layer but is not part of the
    /// presented namespace).
    hidden: String,
}

impl UpperLayer {
    /// Open (creating if needed) the upper layer at `root`.
    ///
    /// # Arguments
    /// * `root` - Directory holding the layer's entries
    /// * `hidden` - Root entry name excluded from listings
    pub fn open(root: impl Into<PathBuf>, hidden: impl Into<String>) -> Result<Self, VfsError> {
        let root: PathBuf = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            hidden: hidden.into(),
        })
    }

    /// The layer's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a layer entry after validation.
    pub fn real_path(&self, path: &str) -> Result<PathBuf, VfsError> {
        let mut full: PathBuf = self.root.clone();
        for segment in split_path(path)? {
            full.push(segment);
        }
        Ok(full)
    }

    /// Metadata for a path, or None when the layer has no entry there.
    pub fn stat(&self, path: &str) -> Result<Option<UpperNode>, VfsError> {
        let full: PathBuf = self.real_path(path)?;
        match std::fs::symlink_metadata(&full) {
            Ok(meta) => Ok(Some(node_from_metadata(&meta))),
            // NotADirectory means a file sits on the path's prefix; the
            // layer has no entry at this path either way.
            Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::NotADirectory) => {
                Ok(None)
            }
            Err(e) => Err(VfsError::Io(e)),
        }
    }

    /// List a directory's entries, name and kind, sorted by name.
    ///
    /// The hidden root entry is skipped. Errors with NotADirectory when
    /// the path holds a file.
    pub fn list(&self, path: &str) -> Result<Vec<(String, EntryKind)>, VfsError> {
        let full: PathBuf = self.real_path(path)?;
        let mut out: Vec<(String, EntryKind)> = Vec::new();
        let reader = match std::fs::read_dir(&full) {
            Ok(r) => r,
            Err(e) if e.kind() == ErrorKind::NotADirectory => {
                return Err(VfsError::NotADirectory(path.to_string()))
            }
            Err(e) => return Err(VfsError::Io(e)),
        };
        for entry in reader {
            let entry = entry?;
            let name: String = entry.file_name().to_string_lossy().into_owned();
            if path.is_empty() && name == self.hidden {
                continue;
            }
            let meta = entry.metadata()?;
            out.push((name, kind_from_metadata(&meta)));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    /// Create all missing directories along `path` inside the layer.
    /// Used when a lower entry is copied up and its parents exist only
    /// in the lower layer.
    pub fn ensure_dir_all(&self, path: &str) -> Result<(), VfsError> {
        let full: PathBuf = self.real_path(path)?;
        std::fs::create_dir_all(&full)?;
        Ok(())
    }

    /// Write a complete file at `path`, atomically.
    ///
    /// The bytes land under a temporary sibling name first and are
    /// renamed into place, so a reader never observes a partial file.
    ///
    /// # Arguments
    /// * `path` - Destination path; parent directories must exist
    /// * `data` - File content
    /// * `perm` - Permission bits for the new file
    pub fn write_atomic(&self, path: &str, data: &[u8], perm: u32) -> Result<(), VfsError> {
        use std::os::unix::fs::PermissionsExt;

        let full: PathBuf = self.real_path(path)?;
        let parent: &Path = full
            .parent()
            .ok_or_else(|| VfsError::InvalidPath(path.to_string()))?;
        let mut temp: tempfile::NamedTempFile = tempfile::NamedTempFile::new_in(parent)?;
        std::io::Write::write_all(&mut temp, data)?;
        temp.as_file()
            .set_permissions(std::fs::Permissions::from_mode(perm))?;
        temp.persist(&full).map_err(|e| VfsError::Io(e.error))?;
        trace!(%path, bytes = data.len(), "wrote upper file");
        Ok(())
    }

    /// Create an empty file, failing if the path already exists.
    pub fn create_file(&self, path: &str, perm: u32) -> Result<(), VfsError> {
        use std::os::unix::fs::OpenOptionsExt;

        let full: PathBuf = self.real_path(path)?;
        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(perm)
            .open(&full)
        {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(VfsError::AlreadyExists(path.to_string()))
            }
            Err(e) => Err(VfsError::Io(e)),
        }
    }

    /// Write `data` at `offset` into an existing file, extending it as
    /// needed.
    ///
    /// # Returns
    /// Number of bytes written.
    pub fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> Result<u32, VfsError> {
        use std::os::unix::fs::FileExt;

        let full: PathBuf = self.real_path(path)?;
        let file: File = OpenOptions::new().write(true).open(&full)?;
        file.write_all_at(data, offset)?;
        Ok(data.len() as u32)
    }

    /// Open a file for reading.
    pub fn open_read(&self, path: &str) -> Result<File, VfsError> {
        let full: PathBuf = self.real_path(path)?;
        match File::open(&full) {
            Ok(f) => Ok(f),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(VfsError::NotFound(path.to_string()))
            }
            Err(e) => Err(VfsError::Io(e)),
        }
    }

    /// Truncate or extend a file to `size` bytes.
    pub fn set_len(&self, path: &str, size: u64) -> Result<(), VfsError> {
        let full: PathBuf = self.real_path(path)?;
        let file: File = OpenOptions::new().write(true).open(&full)?;
        file.set_len(size)?;
        Ok(())
    }

    /// Change a file's permission bits.
    pub fn set_perm(&self, path: &str, perm: u32) -> Result<(), VfsError> {
        use std::os::unix::fs::PermissionsExt;

        let full: PathBuf = self.real_path(path)?;
        std::fs::set_permissions(&full, std::fs::Permissions::from_mode(perm))?;
        Ok(())
    }

    /// Create a directory.
    pub fn mkdir(&self, path: &str, perm: u32) -> Result<(), VfsError> {
        use std::os::unix::fs::PermissionsExt;

        let full: PathBuf = self.real_path(path)?;
        match std::fs::create_dir(&full) {
            Ok(()) => {
                std::fs::set_permissions(&full, std::fs::Permissions::from_mode(perm))?;
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(VfsError::AlreadyExists(path.to_string()))
            }
            Err(e) => Err(VfsError::Io(e)),
        }
    }

    /// Remove an empty directory.
    pub fn rmdir(&self, path: &str) -> Result<(), VfsError> {
        let full: PathBuf = self.real_path(path)?;
        std::fs::remove_dir(&full)?;
        Ok(())
    }

    /// Remove a file or symlink.
    pub fn remove_file(&self, path: &str) -> Result<(), VfsError> {
        let full: PathBuf = self.real_path(path)?;
        std::fs::remove_file(&full)?;
        Ok(())
    }

    /// Rename an entry within the layer.
    pub fn rename(&self, from: &str, to: &str) -> Result<(), VfsError> {
        let from_full: PathBuf = self.real_path(from)?;
        let to_full: PathBuf = self.real_path(to)?;
        std::fs::rename(&from_full, &to_full)?;
        Ok(())
    }

    /// Create a symlink at `path` pointing to `target`.
    pub fn symlink(&self, target: &str, path: &str) -> Result<(), VfsError> {
        let full: PathBuf = self.real_path(path)?;
        match std::os::unix::fs::symlink(target, &full) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(VfsError::AlreadyExists(path.to_string()))
            }
            Err(e) => Err(VfsError::Io(e)),
        }
    }

    /// Read a symlink's target.
    pub fn read_link(&self, path: &str) -> Result<String, VfsError> {
        let full: PathBuf = self.real_path(path)?;
        let target: PathBuf = std::fs::read_link(&full)?;
        Ok(target.to_string_lossy().into_owned())
    }
}

fn kind_from_metadata(meta: &std::fs::Metadata) -> EntryKind {
    if meta.is_dir() {
        EntryKind::Directory
    } else if meta.file_type().is_symlink() {
        EntryKind::Symlink
    } else {
        EntryKind::File
    }
}

fn node_from_metadata(meta: &std::fs::Metadata) -> UpperNode {
    use std::os::unix::fs::PermissionsExt;

    UpperNode {
        kind: kind_from_metadata(meta),
        perm: meta.permissions().mode() & 0o7777,
        size: if meta.is_dir() { 0 } else { meta.len() },
        mtime: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer() -> (tempfile::TempDir, UpperLayer) {
        let dir: tempfile::TempDir = tempfile::TempDir::new().unwrap();
        let upper: UpperLayer = UpperLayer::open(dir.path().join("upper"), ".deleted").unwrap();
        (dir, upper)
    }

    #[test]
    fn test_write_atomic_and_stat() {
        let (_dir, upper) = layer();
        upper.write_atomic("a.txt", b"hello", 0o644).unwrap();

        let node: UpperNode = upper.stat("a.txt").unwrap().unwrap();
        assert_eq!(node.kind, EntryKind::File);
        assert_eq!(node.size, 5);
        assert_eq!(node.perm, 0o644);
    }

    #[test]
    fn test_stat_absent() {
        let (_dir, upper) = layer();
        assert!(upper.stat("missing").unwrap().is_none());
    }

    #[test]
    fn test_hidden_entry_skipped_in_root_listing() {
        let (_dir, upper) = layer();
        upper.mkdir(".deleted", 0o755).unwrap();
        upper.write_atomic("visible.txt", b"x", 0o644).unwrap();

        let names: Vec<String> = upper.list("").unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["visible.txt"]);

        // Only hidden at the root, not in subdirectories.
        upper.mkdir("sub", 0o755).unwrap();
        upper.mkdir("sub/.deleted", 0o755).unwrap();
        let sub: Vec<String> = upper.list("sub").unwrap().into_iter().map(|(n, _)| n).collect();
        assert_eq!(sub, vec![".deleted"]);
    }

    #[test]
    fn test_create_file_exclusive() {
        let (_dir, upper) = layer();
        upper.create_file("a", 0o644).unwrap();
        assert!(matches!(
            upper.create_file("a", 0o644).unwrap_err(),
            VfsError::AlreadyExists(_)
        ));
    }

    #[test]
    fn test_write_at_extends() {
        let (_dir, upper) = layer();
        upper.write_atomic("a", b"0123", 0o644).unwrap();
        assert_eq!(upper.write_at("a", 2, b"XXXX").unwrap(), 4);

        let mut content: Vec<u8> = Vec::new();
        std::io::Read::read_to_end(&mut upper.open_read("a").unwrap(), &mut content).unwrap();
        assert_eq!(content, b"01XXXX".to_vec());
    }

    #[test]
    fn test_symlink_roundtrip() {
        let (_dir, upper) = layer();
        upper.symlink("target/path", "link").unwrap();
        assert_eq!(upper.read_link("link").unwrap(), "target/path");
        assert_eq!(upper.stat("link").unwrap().unwrap().kind, EntryKind::Symlink);
    }

    #[test]
    fn test_escape_rejected() {
        let (_dir, upper) = layer();
        assert!(matches!(
            upper.real_path("../outside").unwrap_err(),
            VfsError::InvalidPath(_)
        ));
    }
}
