//! Per-session inode identity.

use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

/// Unique identifier for an inode.
pub type InodeId = u64;

/// Root directory inode ID (always 1 per FUSE convention).
pub const ROOT_INODE: InodeId = 1;

/// Allocates inode ids keyed by path, stable for the mount session.
///
/// A path receives its id on first touch and keeps it for the lifetime of
/// the table, so repeated lookups of the same path always present the
/// same identity. Upper and lower entries at the same path share one id:
/// the merged namespace has at most one active entry per path.
#[derive(Debug)]
pub struct InodeTable {
    next: AtomicU64,
    by_path: DashMap<String, InodeId>,
    by_ino: DashMap<InodeId, String>,
}

impl InodeTable {
    /// Create a table with the root path pre-registered as inode 1.
    pub fn new() -> Self {
        let table = Self {
            next: AtomicU64::new(ROOT_INODE + 1),
            by_path: DashMap::new(),
            by_ino: DashMap::new(),
        };
        table.by_path.insert(String::new(), ROOT_INODE);
        table.by_ino.insert(ROOT_INODE, String::new());
        table
    }

    /// Get (allocating on first touch) the inode id for a path.
    ///
    /// # Arguments
    /// * `path` - Slash-separated path, empty string for the root
    pub fn ino_for_path(&self, path: &str) -> InodeId {
        *self
            .by_path
            .entry(path.to_string())
            .or_insert_with(|| {
                let id: InodeId = self.next.fetch_add(1, Ordering::SeqCst);
                self.by_ino.insert(id, path.to_string());
                id
            })
            .value()
    }

    /// Resolve an inode id back to its path.
    ///
    /// # Arguments
    /// * `ino` - Inode id handed out earlier
    pub fn path_of(&self, ino: InodeId) -> Option<String> {
        self.by_ino.get(&ino).map(|p| p.value().clone())
    }

    /// Number of registered paths.
    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    /// Whether only the root is registered.
    pub fn is_empty(&self) -> bool {
        self.by_path.len() <= 1
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}
