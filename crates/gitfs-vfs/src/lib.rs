//! Union filesystem serving one git revision with a writable overlay.
//!
//! A mount pins a single revision as an immutable lower layer and
//! merges a directory-backed upper layer on top. Reads fall through to
//! the revision; writes land in the upper layer after copy-up; deletes
//! of lower entries are recorded as tombstones so they persist across
//! mounts. The merged tree is served over FUSE.
//!
//! The crate is backend-agnostic: anything implementing
//! [`ObjectStore`] can provide the lower layer.

pub mod cache;
pub mod error;
pub mod fuse;
pub mod materialize;
pub mod mount;
pub mod object;
pub mod options;
pub mod tree;
pub mod union;

pub use error::VfsError;
pub use fuse::GitFs;
pub use materialize::{Content, Materializer, Strategy};
pub use mount::{build_union, cleanup_stale_mount, mount, serve, spawn_mount};
pub use object::{EntryKind, MemoryObjectStore, ObjectId, ObjectStore, TreeEntry};
pub use options::MountOptions;
pub use tree::{InodeTable, TreeFs, ROOT_INODE};
pub use union::{DeletionTracker, DirEntry, EntryAttr, Layer, OpenContent, UnionFs, UpperLayer};
