//! Read-only view of one revision's tree.
//!
//! Resolves slash-separated paths against the revision's object graph,
//! lists tree entries, and opens blob content through the configured
//! materialization strategy. Nothing here ever writes; mutations happen
//! in the union layer above.

mod inode;

pub use inode::{InodeId, InodeTable, ROOT_INODE};

use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::debug;

use crate::cache::TtlCache;
use crate::error::VfsError;
use crate::materialize::{Content, Materializer};
use crate::object::{EntryKind, ObjectId, ObjectStore, TreeEntry};

/// Default lifetime for cached tree listings. The lower layer is
/// immutable for the life of the mount, so this only bounds memory.
const TREE_CACHE_TTL: Duration = Duration::from_secs(300);

/// Resolved node in the revision tree.
#[derive(Debug, Clone)]
pub struct Node {
    /// Node kind.
    pub kind: EntryKind,
    /// Permission bits.
    pub perm: u32,
    /// Content length in bytes; zero for directories.
    pub size: u64,
    /// Backing object id (tree for directories, blob otherwise).
    pub id: ObjectId,
}

/// Read-only filesystem over a single pinned revision.
///
/// All nodes report the same timestamp: the moment the revision was
/// resolved at mount time.
pub struct TreeFs {
    store: Arc<dyn ObjectStore>,
    root: ObjectId,
    trees: TtlCache<ObjectId, Arc<Vec<TreeEntry>>>,
    materializer: Materializer,
    mounted_at: SystemTime,
}

impl TreeFs {
    /// Resolve `revision` against the store and pin its root tree.
    ///
    /// # Arguments
    /// * `store` - Object store backend
    /// * `revision` - Revision identifier to resolve once, at mount time
    /// * `materializer` - Content strategy for blob reads
    pub async fn open(
        store: Arc<dyn ObjectStore>,
        revision: &str,
        materializer: Materializer,
    ) -> Result<Self, VfsError> {
        let root: ObjectId = store.resolve_revision(revision).await?;
        debug!(%revision, root = %root, "resolved revision root tree");
        Ok(Self {
            store,
            root,
            trees: TtlCache::new(TREE_CACHE_TTL),
            materializer,
            mounted_at: SystemTime::now(),
        })
    }

    /// The pinned root tree id.
    pub fn root_id(&self) -> &ObjectId {
        &self.root
    }

    /// Timestamp reported for every node in this tree.
    pub fn mounted_at(&self) -> SystemTime {
        self.mounted_at
    }

    /// Resolve a path to its node.
    ///
    /// The empty path resolves to the root directory. A missing segment,
    /// or a traversal through a non-directory, reports [`VfsError::NotFound`].
    ///
    /// # Arguments
    /// * `path` - Slash-separated path, no leading slash, empty for root
    pub async fn lookup(&self, path: &str) -> Result<Node, VfsError> {
        let mut node: Node = self.root_node();
        for segment in split_path(path)? {
            if node.kind != EntryKind::Directory {
                return Err(VfsError::NotFound(path.to_string()));
            }
            let entries: Arc<Vec<TreeEntry>> = self.tree_entries(&node.id).await?;
            let entry: &TreeEntry = entries
                .iter()
                .find(|e| e.name == segment)
                .ok_or_else(|| VfsError::NotFound(path.to_string()))?;
            node = self.node_for(entry).await?;
        }
        Ok(node)
    }

    /// List the children of a directory.
    ///
    /// # Arguments
    /// * `path` - Directory path; errors with NotADirectory on files
    pub async fn list_children(&self, path: &str) -> Result<Arc<Vec<TreeEntry>>, VfsError> {
        let node: Node = self.lookup(path).await?;
        if node.kind != EntryKind::Directory {
            return Err(VfsError::NotADirectory(path.to_string()));
        }
        self.tree_entries(&node.id).await
    }

    /// Open a file's content for reading.
    ///
    /// # Arguments
    /// * `path` - File path; errors with IsADirectory on directories
    pub async fn open_for_read(&self, path: &str) -> Result<Content, VfsError> {
        let node: Node = self.lookup(path).await?;
        match node.kind {
            EntryKind::Directory => Err(VfsError::IsADirectory(path.to_string())),
            EntryKind::File | EntryKind::Symlink => {
                self.materializer.open(&node.id, node.size).await
            }
        }
    }

    /// Read a symlink's target path.
    ///
    /// # Arguments
    /// * `path` - Symlink path; errors with InvalidPath on other kinds
    pub async fn read_link(&self, path: &str) -> Result<String, VfsError> {
        let node: Node = self.lookup(path).await?;
        if node.kind != EntryKind::Symlink {
            return Err(VfsError::InvalidPath(format!("not a symlink: {}", path)));
        }
        let bytes: Vec<u8> = self.store.open_blob(&node.id).await?;
        String::from_utf8(bytes)
            .map_err(|_| VfsError::InvalidPath(format!("non-utf8 link target: {}", path)))
    }

    fn root_node(&self) -> Node {
        Node {
            kind: EntryKind::Directory,
            perm: 0o755,
            size: 0,
            id: self.root.clone(),
        }
    }

    async fn node_for(&self, entry: &TreeEntry) -> Result<Node, VfsError> {
        let size: u64 = match entry.kind {
            EntryKind::Directory => 0,
            EntryKind::File | EntryKind::Symlink => self.store.blob_size(&entry.id).await?,
        };
        Ok(Node {
            kind: entry.kind,
            perm: entry.perm,
            size,
            id: entry.id.clone(),
        })
    }

    async fn tree_entries(&self, tree: &ObjectId) -> Result<Arc<Vec<TreeEntry>>, VfsError> {
        if let Some(entries) = self.trees.get(tree) {
            return Ok(entries);
        }
        let entries: Arc<Vec<TreeEntry>> = Arc::new(self.store.list_tree(tree).await?);
        self.trees.insert(tree.clone(), entries.clone());
        Ok(entries)
    }
}

/// Split a relative path into segments, rejecting malformed input.
///
/// Empty input yields no segments (the root). Leading slashes, empty
/// segments, `.` and `..` are all rejected so a path can never escape
/// the tree.
pub fn split_path(path: &str) -> Result<Vec<&str>, VfsError> {
    if path.is_empty() {
        return Ok(Vec::new());
    }
    let segments: Vec<&str> = path.split('/').collect();
    for segment in &segments {
        if segment.is_empty() || *segment == "." || *segment == ".." {
            return Err(VfsError::InvalidPath(path.to_string()));
        }
    }
    Ok(segments)
}
