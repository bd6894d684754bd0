//! Union of a read-only revision tree and a writable upper layer.
//!
//! Resolution order for every path is fixed: deletion record, then upper
//! layer, then lower tree. Mutations never touch the lower tree; entries
//! that originate there are copied up into the upper layer before the
//! first modifying operation proceeds.

mod deletion;
mod upper;

pub use deletion::DeletionTracker;
pub use upper::{UpperLayer, UpperNode};

use std::collections::BTreeMap;
use std::fs::File;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::cache::TtlCache;
use crate::error::VfsError;
use crate::materialize::{Content, READ_ALL_CHUNK};
use crate::object::EntryKind;
use crate::tree::{split_path, TreeFs};

/// Which layer a resolved entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    /// The writable upper layer.
    Upper,
    /// The read-only revision tree.
    Lower,
}

/// Attributes of one entry in the merged namespace.
#[derive(Debug, Clone)]
pub struct EntryAttr {
    /// Entry kind.
    pub kind: EntryKind,
    /// Permission bits.
    pub perm: u32,
    /// Byte length; zero for directories.
    pub size: u64,
    /// Modification time. Lower entries report the mount timestamp.
    pub mtime: SystemTime,
    /// Originating layer.
    pub layer: Layer,
}

/// One child in a merged directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name.
    pub name: String,
    /// Entry kind.
    pub kind: EntryKind,
}

/// Readable content for one open in the merged namespace.
pub enum OpenContent {
    /// Content served from the lower tree through the materializer.
    Lower(Content),
    /// An upper-layer file opened for reading.
    Upper(Arc<File>),
}

impl std::fmt::Debug for OpenContent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OpenContent::Lower(content) => f.debug_tuple("Lower").field(content).finish(),
            OpenContent::Upper(_) => f.debug_tuple("Upper").finish(),
        }
    }
}

impl OpenContent {
    /// Read up to `len` bytes at `offset`; reads past the end clamp.
    pub async fn read_at(&self, offset: u64, len: u32) -> Result<Vec<u8>, VfsError> {
        match self {
            OpenContent::Lower(content) => content.read_at(offset, len).await,
            OpenContent::Upper(file) => {
                use std::os::unix::fs::FileExt;

                let size: u64 = file.metadata()?.len();
                if offset >= size {
                    return Ok(Vec::new());
                }
                let want: usize = (len as u64).min(size - offset) as usize;
                let mut buf: Vec<u8> = vec![0u8; want];
                file.read_exact_at(&mut buf, offset)?;
                Ok(buf)
            }
        }
    }

    /// Read the whole content, in chunks so length is never narrowed.
    pub async fn read_all(&self) -> Result<Vec<u8>, VfsError> {
        match self {
            OpenContent::Lower(content) => content.read_all().await,
            OpenContent::Upper(file) => {
                let size: u64 = file.metadata()?.len();
                self.read_all_chunked(size, READ_ALL_CHUNK).await
            }
        }
    }

    async fn read_all_chunked(&self, size: u64, chunk: u32) -> Result<Vec<u8>, VfsError> {
        let mut data: Vec<u8> = Vec::with_capacity(size.min(isize::MAX as u64) as usize);
        while (data.len() as u64) < size {
            let offset: u64 = data.len() as u64;
            let part: Vec<u8> = self.read_at(offset, chunk).await?;
            if part.is_empty() {
                return Err(VfsError::Truncated {
                    id: "upper".to_string(),
                    expected: size,
                    actual: offset,
                });
            }
            data.extend_from_slice(&part);
        }
        Ok(data)
    }
}

/// The merged filesystem served over the kernel transport.
pub struct UnionFs {
    lower: TreeFs,
    upper: UpperLayer,
    deleted: DeletionTracker,
    /// Path resolution cache; `None` records a recent miss.
    branches: TtlCache<String, Option<EntryAttr>>,
    /// Merged listing cache.
    listings: TtlCache<String, Arc<Vec<DirEntry>>>,
    negative_ttl: Duration,
    /// Per-path mutation locks; rename takes both ends in path order.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl UnionFs {
    /// Assemble the union.
    ///
    /// # Arguments
    /// * `lower` - Pinned revision tree
    /// * `upper` - Writable layer
    /// * `deleted` - Deletion record store
    /// * `branch_ttl` - Lifetime of cached resolutions and listings
    /// * `negative_ttl` - Lifetime of cached misses
    pub fn new(
        lower: TreeFs,
        upper: UpperLayer,
        deleted: DeletionTracker,
        branch_ttl: Duration,
        negative_ttl: Duration,
    ) -> Self {
        Self {
            lower,
            upper,
            deleted,
            branches: TtlCache::new(branch_ttl),
            listings: TtlCache::new(branch_ttl),
            negative_ttl,
            locks: DashMap::new(),
        }
    }

    /// Timestamp reported for lower-layer entries.
    pub fn mounted_at(&self) -> SystemTime {
        self.lower.mounted_at()
    }

    /// Resolve a path in the merged namespace.
    ///
    /// # Arguments
    /// * `path` - Relative path, empty string for the root
    pub async fn lookup(&self, path: &str) -> Result<EntryAttr, VfsError> {
        split_path(path)?;
        if let Some(cached) = self.branches.get(&path.to_string()) {
            return cached.ok_or_else(|| VfsError::NotFound(path.to_string()));
        }

        let resolved: Option<EntryAttr> = self.resolve(path).await?;
        match resolved {
            Some(attr) => {
                self.branches.insert(path.to_string(), Some(attr.clone()));
                Ok(attr)
            }
            None => {
                self.branches
                    .insert_with_ttl(path.to_string(), None, self.negative_ttl);
                Err(VfsError::NotFound(path.to_string()))
            }
        }
    }

    async fn resolve(&self, path: &str) -> Result<Option<EntryAttr>, VfsError> {
        if !path.is_empty() && self.deleted.covers(path)? {
            return Ok(None);
        }
        if let Some(node) = self.upper.stat(path)? {
            return Ok(Some(EntryAttr {
                kind: node.kind,
                perm: node.perm,
                size: node.size,
                mtime: node.mtime,
                layer: Layer::Upper,
            }));
        }
        match self.lower.lookup(path).await {
            Ok(node) => Ok(Some(EntryAttr {
                kind: node.kind,
                perm: node.perm,
                size: node.size,
                mtime: self.lower.mounted_at(),
                layer: Layer::Lower,
            })),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// List a directory's merged children: upper entries union lower
    /// entries, minus deleted and shadowed ones, sorted by name.
    pub async fn list_children(&self, path: &str) -> Result<Arc<Vec<DirEntry>>, VfsError> {
        let attr: EntryAttr = self.lookup(path).await?;
        if attr.kind != EntryKind::Directory {
            return Err(VfsError::NotADirectory(path.to_string()));
        }
        if let Some(cached) = self.listings.get(&path.to_string()) {
            return Ok(cached);
        }

        let mut merged: BTreeMap<String, DirEntry> = BTreeMap::new();

        match self.lower.list_children(path).await {
            Ok(entries) => {
                for entry in entries.iter() {
                    let child: String = child_path(path, &entry.name);
                    if self.deleted.contains(&child)? {
                        continue;
                    }
                    merged.insert(
                        entry.name.clone(),
                        DirEntry {
                            name: entry.name.clone(),
                            kind: entry.kind,
                        },
                    );
                }
            }
            // The directory may exist only in the upper layer.
            Err(e) if e.is_not_found() => {}
            Err(VfsError::NotADirectory(_)) => {}
            Err(e) => return Err(e),
        }

        if let Some(node) = self.upper.stat(path)? {
            if node.kind == EntryKind::Directory {
                for (name, kind) in self.upper.list(path)? {
                    merged.insert(name.clone(), DirEntry { name, kind });
                }
            }
        }

        let listing: Arc<Vec<DirEntry>> = Arc::new(merged.into_values().collect());
        self.listings.insert(path.to_string(), listing.clone());
        Ok(listing)
    }

    /// Open a file's content for reading.
    pub async fn open_for_read(&self, path: &str) -> Result<OpenContent, VfsError> {
        let attr: EntryAttr = self.lookup(path).await?;
        if attr.kind == EntryKind::Directory {
            return Err(VfsError::IsADirectory(path.to_string()));
        }
        match attr.layer {
            Layer::Upper => Ok(OpenContent::Upper(Arc::new(self.upper.open_read(path)?))),
            Layer::Lower => Ok(OpenContent::Lower(self.lower.open_for_read(path).await?)),
        }
    }

    /// Read a byte range of a file. Re-resolves the path so reads always
    /// observe the latest layer, including a copy-up between calls.
    pub async fn read(&self, path: &str, offset: u64, len: u32) -> Result<Vec<u8>, VfsError> {
        self.open_for_read(path).await?.read_at(offset, len).await
    }

    /// Read a symlink's target.
    pub async fn read_link(&self, path: &str) -> Result<String, VfsError> {
        let attr: EntryAttr = self.lookup(path).await?;
        if attr.kind != EntryKind::Symlink {
            return Err(VfsError::InvalidPath(format!("not a symlink: {}", path)));
        }
        match attr.layer {
            Layer::Upper => self.upper.read_link(path),
            Layer::Lower => self.lower.read_link(path).await,
        }
    }

    /// Create an empty file.
    pub async fn create_file(&self, path: &str, perm: u32) -> Result<EntryAttr, VfsError> {
        let _guard = self.lock(path).await;
        self.require_absent(path).await?;
        self.require_parent_dir(path).await?;

        self.upper.ensure_dir_all(parent_of(path))?;
        self.upper.create_file(path, perm)?;
        self.deleted.unmark(path)?;
        self.invalidate(path);
        debug!(%path, "created file");
        self.lookup(path).await
    }

    /// Create a directory.
    pub async fn mkdir(&self, path: &str, perm: u32) -> Result<EntryAttr, VfsError> {
        let _guard = self.lock(path).await;
        self.require_absent(path).await?;
        self.require_parent_dir(path).await?;

        self.upper.ensure_dir_all(parent_of(path))?;
        self.upper.mkdir(path, perm)?;
        self.deleted.unmark(path)?;
        self.invalidate(path);
        debug!(%path, "created directory");
        self.lookup(path).await
    }

    /// Create a symlink at `path` pointing to `target`.
    pub async fn symlink(&self, target: &str, path: &str) -> Result<EntryAttr, VfsError> {
        let _guard = self.lock(path).await;
        self.require_absent(path).await?;
        self.require_parent_dir(path).await?;

        self.upper.ensure_dir_all(parent_of(path))?;
        self.upper.symlink(target, path)?;
        self.deleted.unmark(path)?;
        self.invalidate(path);
        debug!(%path, %target, "created symlink");
        self.lookup(path).await
    }

    /// Write bytes at an offset, copying the file up first when it still
    /// lives in the lower tree.
    pub async fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<u32, VfsError> {
        let _guard = self.lock(path).await;
        let attr: EntryAttr = self.fresh_lookup(path).await?;
        if attr.kind == EntryKind::Directory {
            return Err(VfsError::IsADirectory(path.to_string()));
        }
        if attr.layer == Layer::Lower {
            self.copy_up_entry(path, &attr).await?;
        }
        let written: u32 = self.upper.write_at(path, offset, data)?;
        self.invalidate(path);
        Ok(written)
    }

    /// Truncate or extend a file.
    pub async fn set_len(&self, path: &str, size: u64) -> Result<EntryAttr, VfsError> {
        let _guard = self.lock(path).await;
        let attr: EntryAttr = self.fresh_lookup(path).await?;
        if attr.kind == EntryKind::Directory {
            return Err(VfsError::IsADirectory(path.to_string()));
        }
        if attr.layer == Layer::Lower {
            self.copy_up_entry(path, &attr).await?;
        }
        self.upper.set_len(path, size)?;
        self.invalidate(path);
        self.lookup(path).await
    }

    /// Change permission bits.
    pub async fn set_perm(&self, path: &str, perm: u32) -> Result<EntryAttr, VfsError> {
        let _guard = self.lock(path).await;
        let attr: EntryAttr = self.fresh_lookup(path).await?;
        if attr.layer == Layer::Lower {
            self.copy_up_entry(path, &attr).await?;
        }
        self.upper.set_perm(path, perm)?;
        self.invalidate(path);
        self.lookup(path).await
    }

    /// Remove a file or symlink.
    pub async fn unlink(&self, path: &str) -> Result<(), VfsError> {
        let _guard = self.lock(path).await;
        let attr: EntryAttr = self.fresh_lookup(path).await?;
        if attr.kind == EntryKind::Directory {
            return Err(VfsError::IsADirectory(path.to_string()));
        }

        if self.upper.stat(path)?.is_some() {
            self.upper.remove_file(path)?;
        }
        if self.lower_has(path).await? {
            self.deleted.mark(path)?;
        }
        self.invalidate(path);
        debug!(%path, "unlinked");
        Ok(())
    }

    /// Remove a directory; it must be empty in the merged view.
    pub async fn rmdir(&self, path: &str) -> Result<(), VfsError> {
        if path.is_empty() {
            return Err(VfsError::Conflict("cannot remove the root".to_string()));
        }
        let _guard = self.lock(path).await;
        let attr: EntryAttr = self.fresh_lookup(path).await?;
        if attr.kind != EntryKind::Directory {
            return Err(VfsError::NotADirectory(path.to_string()));
        }
        self.listings.invalidate(&path.to_string());
        if !self.list_children(path).await?.is_empty() {
            return Err(VfsError::NotEmpty(path.to_string()));
        }

        if self.upper.stat(path)?.is_some() {
            self.upper.rmdir(path)?;
        }
        if self.lower_has(path).await? {
            self.deleted.mark(path)?;
        }
        self.invalidate(path);
        debug!(%path, "removed directory");
        Ok(())
    }

    /// Rename an entry, replacing an empty target if one exists.
    pub async fn rename(&self, from: &str, to: &str) -> Result<(), VfsError> {
        if from.is_empty() || to.is_empty() || from == to {
            return Err(VfsError::InvalidPath(format!("{} -> {}", from, to)));
        }
        // Renaming a directory into itself would orphan the subtree.
        if to.starts_with(&format!("{}/", from)) {
            return Err(VfsError::InvalidPath(format!("{} -> {}", from, to)));
        }
        let (_a, _b) = self.lock_pair(from, to).await;

        let src: EntryAttr = self.fresh_lookup(from).await?;
        self.require_parent_dir(to).await?;

        match self.resolve(to).await? {
            Some(dst) if dst.kind == EntryKind::Directory => {
                if src.kind != EntryKind::Directory {
                    return Err(VfsError::IsADirectory(to.to_string()));
                }
                self.listings.invalidate(&to.to_string());
                if !self.list_children(to).await?.is_empty() {
                    return Err(VfsError::NotEmpty(to.to_string()));
                }
                if self.upper.stat(to)?.is_some() {
                    self.upper.rmdir(to)?;
                }
                if self.lower_has(to).await? {
                    self.deleted.mark(to)?;
                }
            }
            Some(_) => {
                if src.kind == EntryKind::Directory {
                    return Err(VfsError::NotADirectory(to.to_string()));
                }
                if self.upper.stat(to)?.is_some() {
                    self.upper.remove_file(to)?;
                }
                if self.lower_has(to).await? {
                    self.deleted.mark(to)?;
                }
            }
            None => {}
        }

        // The whole source subtree must live in the upper layer before
        // the rename can move it.
        self.copy_up_tree(from, &src).await?;
        self.upper.ensure_dir_all(parent_of(to))?;
        self.upper.rename(from, to)?;

        if self.lower_has(from).await? {
            self.deleted.mark(from)?;
        }
        self.unmark_upper_tree(to)?;
        if src.kind == EntryKind::Directory {
            // Every descendant path on both sides changed; per-path
            // invalidation cannot reach them all.
            self.branches.clear();
            self.listings.clear();
        }
        self.invalidate(from);
        self.invalidate(to);
        debug!(%from, %to, "renamed");
        Ok(())
    }

    /// Clear deletion records for every path the moved subtree now
    /// occupies in the upper layer. Records for lower entries the
    /// subtree did not bring along stay in place, so those entries
    /// remain deleted.
    fn unmark_upper_tree(&self, path: &str) -> Result<(), VfsError> {
        self.deleted.unmark(path)?;
        if let Some(node) = self.upper.stat(path)? {
            if node.kind == EntryKind::Directory {
                for (name, _) in self.upper.list(path)? {
                    self.unmark_upper_tree(&child_path(path, &name))?;
                }
            }
        }
        Ok(())
    }

    /// Resolution bypassing the branch cache, for mutation paths that
    /// must not act on stale state.
    async fn fresh_lookup(&self, path: &str) -> Result<EntryAttr, VfsError> {
        split_path(path)?;
        self.branches.invalidate(&path.to_string());
        self.lookup(path).await
    }

    async fn require_absent(&self, path: &str) -> Result<(), VfsError> {
        match self.resolve(path).await? {
            Some(_) => Err(VfsError::AlreadyExists(path.to_string())),
            None => Ok(()),
        }
    }

    async fn require_parent_dir(&self, path: &str) -> Result<(), VfsError> {
        let parent: &str = parent_of(path);
        let attr: EntryAttr = self.lookup(parent).await?;
        if attr.kind != EntryKind::Directory {
            return Err(VfsError::NotADirectory(parent.to_string()));
        }
        Ok(())
    }

    async fn lower_has(&self, path: &str) -> Result<bool, VfsError> {
        match self.lower.lookup(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Copy a single lower entry into the upper layer.
    async fn copy_up_entry(&self, path: &str, attr: &EntryAttr) -> Result<(), VfsError> {
        self.upper.ensure_dir_all(parent_of(path))?;
        match attr.kind {
            EntryKind::Directory => {
                self.upper.ensure_dir_all(path)?;
            }
            EntryKind::File => {
                let data: Vec<u8> = self.lower.open_for_read(path).await?.read_all().await?;
                self.upper.write_atomic(path, &data, attr.perm)?;
                trace!(%path, bytes = data.len(), "copied file up");
            }
            EntryKind::Symlink => {
                let target: String = self.lower.read_link(path).await?;
                self.upper.symlink(&target, path)?;
            }
        }
        Ok(())
    }

    /// Copy a whole subtree up. Files already materialized in the upper
    /// layer are left alone.
    fn copy_up_tree<'a>(
        &'a self,
        path: &'a str,
        attr: &'a EntryAttr,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<(), VfsError>> + Send + 'a>>
    {
        Box::pin(async move {
            if attr.layer == Layer::Upper && attr.kind != EntryKind::Directory {
                return Ok(());
            }
            self.copy_up_entry(path, attr).await?;
            if attr.kind == EntryKind::Directory {
                let children: Arc<Vec<DirEntry>> = self.list_children(path).await?;
                for child in children.iter() {
                    let child_path: String = child_path(path, &child.name);
                    let child_attr: EntryAttr = self.lookup(&child_path).await?;
                    if child_attr.layer == Layer::Lower {
                        self.copy_up_tree(&child_path, &child_attr).await?;
                    }
                }
            }
            Ok(())
        })
    }

    /// Drop cached state for a path and its parent after a mutation.
    fn invalidate(&self, path: &str) {
        let parent: String = parent_of(path).to_string();
        self.branches.invalidate(&path.to_string());
        self.branches.invalidate(&parent);
        self.listings.invalidate(&path.to_string());
        self.listings.invalidate(&parent);
    }

    async fn lock(&self, path: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock: Arc<Mutex<()>> = self
            .locks
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    async fn lock_pair(
        &self,
        a: &str,
        b: &str,
    ) -> (tokio::sync::OwnedMutexGuard<()>, tokio::sync::OwnedMutexGuard<()>) {
        // Consistent acquisition order keeps concurrent renames from
        // deadlocking on each other.
        if a < b {
            let first = self.lock(a).await;
            let second = self.lock(b).await;
            (first, second)
        } else {
            let first = self.lock(b).await;
            let second = self.lock(a).await;
            (first, second)
        }
    }
}

/// Parent path of `path`; the root's parent is the root itself.
fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(idx) => &path[..idx],
        None => "",
    }
}

fn child_path(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::materialize::Materializer;
    use crate::object::MemoryObjectStore;

    async fn sample_union() -> (tempfile::TempDir, UnionFs) {
        let store = Arc::new(MemoryObjectStore::new());
        store.add_file("a.txt", b"lower a".to_vec());
        store.add_file("b.txt", b"lower b".to_vec());
        store.add_file("src/main.rs", b"fn main() {}".to_vec());

        let dir: tempfile::TempDir = tempfile::TempDir::new().unwrap();
        let lower: TreeFs = TreeFs::open(store.clone(), "HEAD", Materializer::lazy(store.clone()))
            .await
            .unwrap();
        let upper: UpperLayer = UpperLayer::open(dir.path().join("upper"), ".deleted").unwrap();
        let deleted: DeletionTracker = DeletionTracker::open(
            dir.path().join("upper").join(".deleted"),
            Duration::from_secs(5),
        )
        .unwrap();
        let union: UnionFs = UnionFs::new(
            lower,
            upper,
            deleted,
            Duration::from_secs(5),
            Duration::from_secs(1),
        );
        (dir, union)
    }

    #[tokio::test]
    async fn test_lower_visible_through_union() {
        let (_dir, fs) = sample_union().await;
        let attr: EntryAttr = fs.lookup("a.txt").await.unwrap();
        assert_eq!(attr.layer, Layer::Lower);
        assert_eq!(fs.read("a.txt", 0, 100).await.unwrap(), b"lower a".to_vec());
    }

    #[tokio::test]
    async fn test_write_copies_up() {
        let (_dir, fs) = sample_union().await;
        fs.write("a.txt", 0, b"UPPER").await.unwrap();

        let attr: EntryAttr = fs.lookup("a.txt").await.unwrap();
        assert_eq!(attr.layer, Layer::Upper);
        // Unwritten tail of the copied-up file is preserved.
        assert_eq!(fs.read("a.txt", 0, 100).await.unwrap(), b"UPPER a".to_vec());
    }

    #[tokio::test]
    async fn test_unlink_lower_then_recreate() {
        let (_dir, fs) = sample_union().await;
        fs.unlink("a.txt").await.unwrap();
        assert!(fs.lookup("a.txt").await.unwrap_err().is_not_found());

        let attr: EntryAttr = fs.create_file("a.txt", 0o644).await.unwrap();
        assert_eq!(attr.layer, Layer::Upper);
        assert_eq!(attr.size, 0);
    }

    #[tokio::test]
    async fn test_merged_listing() {
        let (_dir, fs) = sample_union().await;
        fs.create_file("c.txt", 0o644).await.unwrap();
        fs.write("b.txt", 0, b"shadowed").await.unwrap();
        fs.unlink("a.txt").await.unwrap();

        let names: Vec<String> = fs
            .list_children("")
            .await
            .unwrap()
            .iter()
            .map(|e| e.name.clone())
            .collect();
        assert_eq!(names, vec!["b.txt", "c.txt", "src"]);
    }

    #[tokio::test]
    async fn test_mutation_invalidates_listing_cache() {
        let (_dir, fs) = sample_union().await;
        // Prime the cache, then mutate within the TTL.
        fs.list_children("").await.unwrap();
        fs.unlink("a.txt").await.unwrap();

        let names: Vec<String> = fs
            .list_children("")
            .await
            .unwrap()
            .iter()
            .map(|e| e.name.clone())
            .collect();
        assert!(!names.contains(&"a.txt".to_string()));
    }

    #[tokio::test]
    async fn test_create_after_cached_miss() {
        let (_dir, fs) = sample_union().await;
        // Prime a negative entry, then create within the negative TTL.
        assert!(fs.lookup("new.txt").await.unwrap_err().is_not_found());
        fs.create_file("new.txt", 0o644).await.unwrap();
        assert!(fs.lookup("new.txt").await.is_ok());
    }

    #[tokio::test]
    async fn test_mkdir_and_rmdir() {
        let (_dir, fs) = sample_union().await;
        fs.mkdir("newdir", 0o755).await.unwrap();
        assert!(matches!(
            fs.mkdir("newdir", 0o755).await.unwrap_err(),
            VfsError::AlreadyExists(_)
        ));

        fs.create_file("newdir/f", 0o644).await.unwrap();
        assert!(matches!(
            fs.rmdir("newdir").await.unwrap_err(),
            VfsError::NotEmpty(_)
        ));
        fs.unlink("newdir/f").await.unwrap();
        fs.rmdir("newdir").await.unwrap();
        assert!(fs.lookup("newdir").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rmdir_lower_requires_empty() {
        let (_dir, fs) = sample_union().await;
        assert!(matches!(
            fs.rmdir("src").await.unwrap_err(),
            VfsError::NotEmpty(_)
        ));
        fs.unlink("src/main.rs").await.unwrap();
        fs.rmdir("src").await.unwrap();
        assert!(fs.lookup("src/main.rs").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_rename_lower_file() {
        let (_dir, fs) = sample_union().await;
        fs.rename("a.txt", "renamed.txt").await.unwrap();

        assert!(fs.lookup("a.txt").await.unwrap_err().is_not_found());
        assert_eq!(
            fs.read("renamed.txt", 0, 100).await.unwrap(),
            b"lower a".to_vec()
        );
    }

    #[tokio::test]
    async fn test_rename_lower_directory() {
        let (_dir, fs) = sample_union().await;
        fs.rename("src", "lib").await.unwrap();

        assert!(fs.lookup("src").await.unwrap_err().is_not_found());
        assert!(fs.lookup("src/main.rs").await.unwrap_err().is_not_found());
        assert_eq!(
            fs.read("lib/main.rs", 0, 100).await.unwrap(),
            b"fn main() {}".to_vec()
        );
    }

    #[tokio::test]
    async fn test_rename_into_own_subtree_rejected() {
        let (_dir, fs) = sample_union().await;
        assert!(matches!(
            fs.rename("src", "src/inner").await.unwrap_err(),
            VfsError::InvalidPath(_)
        ));
    }

    #[tokio::test]
    async fn test_upper_read_all_reassembles_across_chunks() {
        let (_dir, fs) = sample_union().await;
        fs.create_file("big.txt", 0o644).await.unwrap();
        fs.write("big.txt", 0, b"0123456789").await.unwrap();

        let content: OpenContent = fs.open_for_read("big.txt").await.unwrap();
        // A chunk smaller than the file forces multiple positioned reads.
        let data: Vec<u8> = content.read_all_chunked(10, 4).await.unwrap();
        assert_eq!(data, b"0123456789".to_vec());
    }

    #[tokio::test]
    async fn test_symlink_and_read_link() {
        let (_dir, fs) = sample_union().await;
        fs.symlink("a.txt", "link").await.unwrap();
        assert_eq!(fs.read_link("link").await.unwrap(), "a.txt");
        assert_eq!(
            fs.lookup("link").await.unwrap().kind,
            EntryKind::Symlink
        );
    }

    #[tokio::test]
    async fn test_set_len_truncates_lower() {
        let (_dir, fs) = sample_union().await;
        let attr: EntryAttr = fs.set_len("a.txt", 5).await.unwrap();
        assert_eq!(attr.size, 5);
        assert_eq!(fs.read("a.txt", 0, 100).await.unwrap(), b"lower".to_vec());
    }

    #[tokio::test]
    async fn test_deletions_persist_across_sessions() {
        let store = Arc::new(MemoryObjectStore::new());
        store.add_file("a.txt", b"lower".to_vec());
        let dir: tempfile::TempDir = tempfile::TempDir::new().unwrap();

        let build = |store: Arc<MemoryObjectStore>| {
            let upper_dir = dir.path().join("upper");
            async move {
                let lower: TreeFs =
                    TreeFs::open(store.clone(), "HEAD", Materializer::lazy(store.clone()))
                        .await
                        .unwrap();
                let upper: UpperLayer = UpperLayer::open(&upper_dir, ".deleted").unwrap();
                let deleted: DeletionTracker =
                    DeletionTracker::open(upper_dir.join(".deleted"), Duration::from_secs(5))
                        .unwrap();
                UnionFs::new(
                    lower,
                    upper,
                    deleted,
                    Duration::from_secs(5),
                    Duration::from_secs(1),
                )
            }
        };

        let fs: UnionFs = build(store.clone()).await;
        fs.unlink("a.txt").await.unwrap();
        drop(fs);

        let fs: UnionFs = build(store).await;
        assert!(fs.lookup("a.txt").await.unwrap_err().is_not_found());
    }
}
