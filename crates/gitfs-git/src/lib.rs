//! Git object database backend.
//!
//! Implements [`ObjectStore`] over a local repository through libgit2.
//! Revisions are resolved with the full rev-parse syntax (`HEAD`,
//! branch and tag names, abbreviated hashes, `HEAD~2`, ...), then
//! peeled to the commit's root tree.

use std::path::Path;
use std::sync::Mutex;

use async_trait::async_trait;
use git2::{ErrorCode, ObjectType, Oid, Repository};
use tracing::debug;

use gitfs_vfs::{EntryKind, ObjectId, ObjectStore, TreeEntry, VfsError};

const MODE_DIR: i32 = 0o040000;
const MODE_SYMLINK: i32 = 0o120000;
const MODE_GITLINK: i32 = 0o160000;
const MODE_EXECUTABLE: i32 = 0o100755;

/// [`ObjectStore`] backed by a git repository on local disk.
///
/// libgit2 repository handles are not thread safe, so the handle sits
/// behind a mutex; all object reads are short local operations.
pub struct GitObjectStore {
    repo: Mutex<Repository>,
}

impl std::fmt::Debug for GitObjectStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GitObjectStore").finish_non_exhaustive()
    }
}

impl GitObjectStore {
    /// Open the repository at `path` (a work tree or a bare git dir).
    pub fn open(path: &Path) -> Result<Self, VfsError> {
        let repo: Repository = Repository::open(path).map_err(|e| match e.code() {
            ErrorCode::NotFound => VfsError::NotFound(path.display().to_string()),
            _ => VfsError::store(e),
        })?;
        debug!(path = %path.display(), bare = repo.is_bare(), "opened repository");
        Ok(Self {
            repo: Mutex::new(repo),
        })
    }

    fn oid_of(id: &ObjectId) -> Result<Oid, VfsError> {
        Oid::from_str(id.as_str()).map_err(VfsError::store)
    }
}

#[async_trait]
impl ObjectStore for GitObjectStore {
    async fn resolve_revision(&self, revision: &str) -> Result<ObjectId, VfsError> {
        let repo = self.repo.lock().unwrap();
        let object: git2::Object<'_> = repo.revparse_single(revision).map_err(|e| {
            match e.code() {
                ErrorCode::NotFound | ErrorCode::InvalidSpec => {
                    VfsError::NotFound(revision.to_string())
                }
                _ => VfsError::store(e),
            }
        })?;
        let commit: git2::Commit<'_> = object.peel_to_commit().map_err(VfsError::store)?;
        let tree_id: Oid = commit.tree_id();
        debug!(%revision, commit = %commit.id(), tree = %tree_id, "resolved revision");
        Ok(ObjectId::new(tree_id.to_string()))
    }

    async fn list_tree(&self, tree: &ObjectId) -> Result<Vec<TreeEntry>, VfsError> {
        let oid: Oid = Self::oid_of(tree)?;
        let repo = self.repo.lock().unwrap();
        let tree: git2::Tree<'_> = repo.find_tree(oid).map_err(VfsError::store)?;

        let mut entries: Vec<TreeEntry> = Vec::with_capacity(tree.len());
        for entry in tree.iter() {
            let name: String = match entry.name() {
                Some(n) => n.to_string(),
                None => continue,
            };
            let (kind, perm): (EntryKind, u32) = match entry.filemode() {
                MODE_DIR => (EntryKind::Directory, 0o755),
                MODE_SYMLINK => (EntryKind::Symlink, 0o777),
                // Submodule pointers have no content in this repository.
                MODE_GITLINK => continue,
                mode => (
                    EntryKind::File,
                    TreeEntry::file_perm(mode == MODE_EXECUTABLE),
                ),
            };
            entries.push(TreeEntry {
                name,
                kind,
                perm,
                id: ObjectId::new(entry.id().to_string()),
            });
        }
        Ok(entries)
    }

    async fn blob_size(&self, blob: &ObjectId) -> Result<u64, VfsError> {
        let oid: Oid = Self::oid_of(blob)?;
        let repo = self.repo.lock().unwrap();
        // Header read only; the content stays packed.
        let (size, kind): (usize, ObjectType) = repo
            .odb()
            .map_err(VfsError::store)?
            .read_header(oid)
            .map_err(VfsError::store)?;
        if kind != ObjectType::Blob {
            return Err(VfsError::store(format!("not a blob: {}", blob)));
        }
        Ok(size as u64)
    }

    async fn open_blob(&self, blob: &ObjectId) -> Result<Vec<u8>, VfsError> {
        let oid: Oid = Self::oid_of(blob)?;
        let repo = self.repo.lock().unwrap();
        let blob: git2::Blob<'_> = repo.find_blob(oid).map_err(VfsError::store)?;
        Ok(blob.content().to_vec())
    }
}
