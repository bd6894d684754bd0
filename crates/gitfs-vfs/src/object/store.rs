//! ObjectStore trait for resolving revisions and reading objects.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::error::VfsError;

use super::types::{EntryKind, ObjectId, TreeEntry};

/// Trait for backends that resolve a revision and stream its objects.
///
/// Implement this trait to serve a tree from different object databases
/// (a git repository, an in-memory store for tests). All methods must be
/// safe for concurrent calls.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Resolve a revision identifier to the id of its root tree.
    ///
    /// # Arguments
    /// * `revision` - Revision identifier (commit hash, ref name, ...)
    async fn resolve_revision(&self, revision: &str) -> Result<ObjectId, VfsError>;

    /// List the entries of a tree object in stored order.
    ///
    /// # Arguments
    /// * `tree` - Tree object id
    async fn list_tree(&self, tree: &ObjectId) -> Result<Vec<TreeEntry>, VfsError>;

    /// Byte length of a blob, without reading its content.
    ///
    /// # Arguments
    /// * `blob` - Blob object id
    async fn blob_size(&self, blob: &ObjectId) -> Result<u64, VfsError>;

    /// Read the full content of a blob.
    ///
    /// Must return exactly the blob's bytes or an error; never a
    /// truncated prefix.
    ///
    /// # Arguments
    /// * `blob` - Blob object id
    async fn open_blob(&self, blob: &ObjectId) -> Result<Vec<u8>, VfsError>;

    /// Read a byte range of a blob.
    ///
    /// # Arguments
    /// * `blob` - Blob object id
    /// * `offset` - Start offset in bytes
    /// * `size` - Number of bytes to read
    async fn read_blob_range(
        &self,
        blob: &ObjectId,
        offset: u64,
        size: u64,
    ) -> Result<Vec<u8>, VfsError> {
        let data: Vec<u8> = self.open_blob(blob).await?;
        let start: usize = (offset.min(data.len() as u64)) as usize;
        let end: usize = ((offset + size).min(data.len() as u64)) as usize;
        Ok(data[start..end].to_vec())
    }
}

/// Entry in the in-memory store's flat path map.
#[derive(Debug, Clone)]
enum MemEntry {
    File { content: Vec<u8>, executable: bool },
    Symlink { target: String },
}

/// In-memory object store for testing.
///
/// Paths are inserted flat; tree objects are synthesized on demand with
/// ids of the form `tree:<path>`, blobs as `blob:<path>`. Counts
/// `open_blob` calls so tests can assert materialize-once behavior.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    entries: RwLock<BTreeMap<String, MemEntry>>,
    open_blob_calls: AtomicU64,
}

impl MemoryObjectStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a regular file at `path`.
    ///
    /// # Arguments
    /// * `path` - Slash-separated path, no leading slash
    /// * `content` - File bytes
    pub fn add_file(&self, path: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.entries.write().unwrap().insert(
            path.into(),
            MemEntry::File {
                content: content.into(),
                executable: false,
            },
        );
    }

    /// Add an executable file at `path`.
    pub fn add_executable(&self, path: impl Into<String>, content: impl Into<Vec<u8>>) {
        self.entries.write().unwrap().insert(
            path.into(),
            MemEntry::File {
                content: content.into(),
                executable: true,
            },
        );
    }

    /// Add a symlink at `path` pointing at `target`.
    pub fn add_symlink(&self, path: impl Into<String>, target: impl Into<String>) {
        self.entries.write().unwrap().insert(
            path.into(),
            MemEntry::Symlink {
                target: target.into(),
            },
        );
    }

    /// Number of `open_blob` calls served so far.
    pub fn open_blob_count(&self) -> u64 {
        self.open_blob_calls.load(Ordering::SeqCst)
    }

    /// Blob id for a stored path, as handed out in tree listings.
    pub fn blob_id(&self, path: &str) -> ObjectId {
        ObjectId::new(format!("blob:{}", path))
    }

    fn tree_prefix(tree: &ObjectId) -> Result<String, VfsError> {
        match tree.as_str().strip_prefix("tree:") {
            Some(p) => Ok(p.to_string()),
            None => Err(VfsError::store(format!("not a tree id: {}", tree))),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn resolve_revision(&self, _revision: &str) -> Result<ObjectId, VfsError> {
        Ok(ObjectId::new("tree:"))
    }

    async fn list_tree(&self, tree: &ObjectId) -> Result<Vec<TreeEntry>, VfsError> {
        let prefix: String = Self::tree_prefix(tree)?;
        let entries = self.entries.read().unwrap();

        let mut children: BTreeMap<String, TreeEntry> = BTreeMap::new();
        for (path, entry) in entries.iter() {
            let rest: &str = if prefix.is_empty() {
                path.as_str()
            } else {
                match path.strip_prefix(&format!("{}/", prefix)) {
                    Some(r) => r,
                    None => continue,
                }
            };

            match rest.split_once('/') {
                Some((dir, _)) => {
                    let child_path: String = if prefix.is_empty() {
                        dir.to_string()
                    } else {
                        format!("{}/{}", prefix, dir)
                    };
                    children.entry(dir.to_string()).or_insert(TreeEntry {
                        name: dir.to_string(),
                        kind: EntryKind::Directory,
                        perm: 0o755,
                        id: ObjectId::new(format!("tree:{}", child_path)),
                    });
                }
                None => {
                    let (kind, perm) = match entry {
                        MemEntry::File { executable, .. } => {
                            (EntryKind::File, TreeEntry::file_perm(*executable))
                        }
                        MemEntry::Symlink { .. } => (EntryKind::Symlink, 0o777),
                    };
                    children.insert(
                        rest.to_string(),
                        TreeEntry {
                            name: rest.to_string(),
                            kind,
                            perm,
                            id: ObjectId::new(format!("blob:{}", path)),
                        },
                    );
                }
            }
        }

        Ok(children.into_values().collect())
    }

    async fn blob_size(&self, blob: &ObjectId) -> Result<u64, VfsError> {
        let path: &str = blob
            .as_str()
            .strip_prefix("blob:")
            .ok_or_else(|| VfsError::store(format!("not a blob id: {}", blob)))?;
        let entries = self.entries.read().unwrap();
        match entries.get(path) {
            Some(MemEntry::File { content, .. }) => Ok(content.len() as u64),
            Some(MemEntry::Symlink { target }) => Ok(target.len() as u64),
            None => Err(VfsError::store(format!("unknown blob: {}", blob))),
        }
    }

    async fn open_blob(&self, blob: &ObjectId) -> Result<Vec<u8>, VfsError> {
        self.open_blob_calls.fetch_add(1, Ordering::SeqCst);
        let path: &str = blob
            .as_str()
            .strip_prefix("blob:")
            .ok_or_else(|| VfsError::store(format!("not a blob id: {}", blob)))?;
        let entries = self.entries.read().unwrap();
        match entries.get(path) {
            Some(MemEntry::File { content, .. }) => Ok(content.clone()),
            Some(MemEntry::Symlink { target }) => Ok(target.clone().into_bytes()),
            None => Err(VfsError::store(format!("unknown blob: {}", blob))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_root() {
        let store: MemoryObjectStore = MemoryObjectStore::new();
        store.add_file("readme.md", b"hello".to_vec());
        store.add_file("src/main.rs", b"fn main() {}".to_vec());

        let root: ObjectId = store.resolve_revision("HEAD").await.unwrap();
        let entries: Vec<TreeEntry> = store.list_tree(&root).await.unwrap();
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();

        assert_eq!(names, vec!["readme.md", "src"]);
        assert_eq!(entries[1].kind, EntryKind::Directory);
    }

    #[tokio::test]
    async fn test_nested_tree() {
        let store: MemoryObjectStore = MemoryObjectStore::new();
        store.add_file("src/lib.rs", b"".to_vec());
        store.add_file("src/util/mod.rs", b"".to_vec());

        let src: Vec<TreeEntry> = store.list_tree(&ObjectId::new("tree:src")).await.unwrap();
        let names: Vec<&str> = src.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["lib.rs", "util"]);
    }

    #[tokio::test]
    async fn test_open_blob_counts_calls() {
        let store: MemoryObjectStore = MemoryObjectStore::new();
        store.add_file("a.txt", b"abc".to_vec());

        let blob: ObjectId = store.blob_id("a.txt");
        assert_eq!(store.open_blob(&blob).await.unwrap(), b"abc".to_vec());
        assert_eq!(store.open_blob(&blob).await.unwrap(), b"abc".to_vec());
        assert_eq!(store.open_blob_count(), 2);
    }

    #[tokio::test]
    async fn test_range_read() {
        let store: MemoryObjectStore = MemoryObjectStore::new();
        store.add_file("a.txt", b"0123456789".to_vec());

        let blob: ObjectId = store.blob_id("a.txt");
        let data: Vec<u8> = store.read_blob_range(&blob, 3, 4).await.unwrap();
        assert_eq!(data, b"3456".to_vec());

        // Past-end reads clamp instead of failing.
        let tail: Vec<u8> = store.read_blob_range(&blob, 8, 10).await.unwrap();
        assert_eq!(tail, b"89".to_vec());
    }
}
