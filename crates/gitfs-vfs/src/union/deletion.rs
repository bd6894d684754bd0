//! Persistent deletion records (whiteouts).
//!
//! Deleting an entry that exists in the read-only lower layer cannot
//! remove it from the revision, so the deletion is recorded as a
//! tombstone file. Records live in a flat directory inside the upper
//! layer: one empty file per deleted path, named by the escaped path.
//! Flat naming avoids mirroring the tree and so never conflicts with a
//! later re-creation of the path as a different kind.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::VfsError;

/// Cached snapshot of every recorded path.
#[derive(Debug)]
struct Snapshot {
    paths: HashSet<String>,
    taken: Instant,
}

/// Tracks deletion records under one directory.
///
/// The record set is re-read from disk at most once per TTL; marking or
/// unmarking drops the snapshot immediately so the union layer always
/// observes its own writes.
#[derive(Debug)]
pub struct DeletionTracker {
    dir: PathBuf,
    ttl: Duration,
    snapshot: Mutex<Option<Snapshot>>,
}

impl DeletionTracker {
    /// Open (creating if needed) the record directory.
    ///
    /// # Arguments
    /// * `dir` - Directory holding the tombstone files
    /// * `ttl` - Lifetime of the cached record set
    pub fn open(dir: impl Into<PathBuf>, ttl: Duration) -> Result<Self, VfsError> {
        let dir: PathBuf = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            ttl,
            snapshot: Mutex::new(None),
        })
    }

    /// Record `path` as deleted. Idempotent.
    pub fn mark(&self, path: &str) -> Result<(), VfsError> {
        let file: PathBuf = self.dir.join(escape(path));
        std::fs::write(&file, b"")?;
        trace!(%path, "recorded deletion");
        self.invalidate();
        Ok(())
    }

    /// Drop the record for `path`, if any. Called when the path is
    /// re-created.
    pub fn unmark(&self, path: &str) -> Result<(), VfsError> {
        let file: PathBuf = self.dir.join(escape(path));
        match std::fs::remove_file(&file) {
            Ok(()) => {
                trace!(%path, "cleared deletion record");
                self.invalidate();
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(VfsError::Io(e)),
        }
    }

    /// Whether `path` itself has a deletion record.
    pub fn contains(&self, path: &str) -> Result<bool, VfsError> {
        Ok(self.paths()?.contains(path))
    }

    /// Whether `path` or any of its ancestors has a deletion record.
    pub fn covers(&self, path: &str) -> Result<bool, VfsError> {
        let paths: HashSet<String> = self.paths()?;
        if paths.contains(path) {
            return Ok(true);
        }
        let mut prefix: &str = path;
        while let Some(idx) = prefix.rfind('/') {
            prefix = &prefix[..idx];
            if paths.contains(prefix) {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Drop the cached record set so the next query re-reads the disk.
    pub fn invalidate(&self) {
        *self.snapshot.lock().unwrap() = None;
    }

    fn paths(&self) -> Result<HashSet<String>, VfsError> {
        let mut guard = self.snapshot.lock().unwrap();
        if let Some(snap) = guard.as_ref() {
            if snap.taken.elapsed() <= self.ttl {
                return Ok(snap.paths.clone());
            }
        }

        let mut paths: HashSet<String> = HashSet::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name: String = entry.file_name().to_string_lossy().into_owned();
            paths.insert(unescape(&name));
        }
        *guard = Some(Snapshot {
            paths: paths.clone(),
            taken: Instant::now(),
        });
        Ok(paths)
    }
}

/// Escape a path into a single filename: `%` then `/` are replaced so
/// the mapping is reversible and never produces nested names.
fn escape(path: &str) -> String {
    path.replace('%', "%25").replace('/', "%2f")
}

fn unescape(name: &str) -> String {
    name.replace("%2f", "/").replace("%25", "%")
}
