//! Identifiers and entry descriptors for the revision object graph.

use std::fmt;

/// Identifier of an object (tree or blob) in the revision's object graph.
///
/// Stored as the backend's hex/string form; the VFS only compares and
/// forwards it, it never interprets the bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectId(String);

impl ObjectId {
    /// Wrap a backend identifier.
    pub fn new(id: impl Into<String>) -> Self {
        ObjectId(id.into())
    }

    /// The identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Kind of a tree entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    /// Directory (tree object).
    Directory,
    /// Regular file (blob object).
    File,
    /// Symbolic link (blob object holding the target path).
    Symlink,
}

/// One entry of a tree object.
#[derive(Debug, Clone)]
pub struct TreeEntry {
    /// Entry name (single path segment, case-sensitive).
    pub name: String,
    /// Entry kind.
    pub kind: EntryKind,
    /// Permission bits presented for this entry.
    pub perm: u32,
    /// Identifier of the child object.
    pub id: ObjectId,
}

impl TreeEntry {
    /// Permission bits for a file entry given its executable flag.
    pub fn file_perm(executable: bool) -> u32 {
        if executable {
            0o755
        } else {
            0o644
        }
    }
}
