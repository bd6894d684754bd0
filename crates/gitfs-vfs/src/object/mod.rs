//! Object resolver primitives.
//!
//! The revision's object graph is consumed through the [`ObjectStore`]
//! trait; backends (a git object database, an in-memory store for tests)
//! live behind it.

mod store;
mod types;

pub use store::{MemoryObjectStore, ObjectStore};
pub use types::{EntryKind, ObjectId, TreeEntry};
