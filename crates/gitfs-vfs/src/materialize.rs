//! Blob materialization strategies.
//!
//! Converts a blob handle into readable content one of two ways:
//! - `Lazy`: every read pulls the requested range straight from the
//!   object store; no local copy.
//! - `Disk`: the first open extracts the whole blob into a scratch file
//!   and every read (from any handle) is served from that file.
//!
//! Scratch files belong exclusively to the [`Materializer`]; they live in
//! a per-session temporary directory that is removed when the
//! materializer is dropped at unmount.

use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use tempfile::TempDir;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::VfsError;
use crate::object::{ObjectId, ObjectStore};

/// How file content is produced for reads, chosen once per mount.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Stream bytes from the object store on every read.
    Lazy,
    /// Extract each blob once into a scratch file and read from disk.
    Disk,
}

/// Produces readable content for blob handles.
pub struct Materializer {
    store: Arc<dyn ObjectStore>,
    strategy: Strategy,
    /// Session scratch directory, present only for the disk strategy.
    /// Dropping it removes all scratch files.
    scratch: Option<TempDir>,
    /// Single-flight cells: one extraction per blob per session, all
    /// concurrent first opens wait on the same cell.
    extracted: DashMap<ObjectId, Arc<OnceCell<PathBuf>>>,
}

impl Materializer {
    /// Create a lazy (stream-on-read) materializer.
    pub fn lazy(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            strategy: Strategy::Lazy,
            scratch: None,
            extracted: DashMap::new(),
        }
    }

    /// Create a disk (extract-once) materializer.
    ///
    /// # Arguments
    /// * `store` - Backing object store
    /// * `scratch_root` - Directory under which the session scratch
    ///   directory is created; created if absent
    pub fn disk(store: Arc<dyn ObjectStore>, scratch_root: &std::path::Path) -> Result<Self, VfsError> {
        std::fs::create_dir_all(scratch_root)?;
        let scratch: TempDir = tempfile::Builder::new()
            .prefix("gitfs-scratch-")
            .tempdir_in(scratch_root)?;
        debug!(dir = %scratch.path().display(), "created scratch directory");
        Ok(Self {
            store,
            strategy: Strategy::Disk,
            scratch: Some(scratch),
            extracted: DashMap::new(),
        })
    }

    /// The strategy this materializer was built with.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Path of the session scratch directory (disk strategy only).
    pub fn scratch_path(&self) -> Option<&std::path::Path> {
        self.scratch.as_ref().map(|d| d.path())
    }

    /// Open a blob for reading using the configured strategy.
    ///
    /// Under the disk strategy the first open of a blob blocks until the
    /// extraction completes; concurrent first opens coordinate so the
    /// blob is fetched exactly once.
    ///
    /// # Arguments
    /// * `blob` - Blob object id
    /// * `size` - Expected byte length (from the entry's attributes)
    pub async fn open(&self, blob: &ObjectId, size: u64) -> Result<Content, VfsError> {
        match self.strategy {
            Strategy::Lazy => Ok(Content::Lazy {
                store: self.store.clone(),
                blob: blob.clone(),
                size,
            }),
            Strategy::Disk => {
                let path: PathBuf = self.extract(blob, size).await?;
                let file: File = File::open(&path)?;
                Ok(Content::Disk {
                    file: Arc::new(file),
                    size,
                })
            }
        }
    }

    /// Extract a blob to its scratch file, once per session.
    async fn extract(&self, blob: &ObjectId, size: u64) -> Result<PathBuf, VfsError> {
        let cell: Arc<OnceCell<PathBuf>> = self
            .extracted
            .entry(blob.clone())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        let path: &PathBuf = cell
            .get_or_try_init(|| async {
                let scratch = self
                    .scratch
                    .as_ref()
                    .ok_or_else(|| VfsError::MountFailed("no scratch directory".to_string()))?;

                let data: Vec<u8> = self.store.open_blob(blob).await?;
                if data.len() as u64 != size {
                    return Err(VfsError::Truncated {
                        id: blob.to_string(),
                        expected: size,
                        actual: data.len() as u64,
                    });
                }

                // Write to a temp name and rename so a partially written
                // file is never observable under the final name.
                let name: String = blob.as_str().replace(['/', ':'], "_");
                let final_path: PathBuf = scratch.path().join(&name);
                let temp_path: PathBuf = scratch.path().join(format!("{}.tmp", name));
                if let Err(e) = std::fs::write(&temp_path, &data) {
                    let _ = std::fs::remove_file(&temp_path);
                    return Err(VfsError::Io(e));
                }
                std::fs::rename(&temp_path, &final_path)?;
                debug!(blob = %blob, bytes = data.len(), "extracted blob to scratch");
                Ok(final_path)
            })
            .await?;

        Ok(path.clone())
    }
}

/// Readable content for one open of a blob.
#[derive(Clone)]
pub enum Content {
    /// Range reads forwarded to the object store.
    Lazy {
        /// Backing store.
        store: Arc<dyn ObjectStore>,
        /// Blob id.
        blob: ObjectId,
        /// Blob length.
        size: u64,
    },
    /// Random-access reads from the extracted scratch file.
    Disk {
        /// Open scratch file, shared across opens of the same blob.
        file: Arc<File>,
        /// Blob length.
        size: u64,
    },
}

impl std::fmt::Debug for Content {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Content::Lazy { blob, size, .. } => f
                .debug_struct("Lazy")
                .field("blob", blob)
                .field("size", size)
                .finish(),
            Content::Disk { size, .. } => {
                f.debug_struct("Disk").field("size", size).finish()
            }
        }
    }
}

/// Largest single range request issued while reading a whole blob.
pub(crate) const READ_ALL_CHUNK: u32 = 1 << 30;

impl Content {
    /// Content length in bytes.
    pub fn size(&self) -> u64 {
        match self {
            Content::Lazy { size, .. } | Content::Disk { size, .. } => *size,
        }
    }

    /// Read up to `len` bytes at `offset`; reads past the end clamp.
    ///
    /// # Arguments
    /// * `offset` - Start offset in bytes
    /// * `len` - Requested byte count
    pub async fn read_at(&self, offset: u64, len: u32) -> Result<Vec<u8>, VfsError> {
        let size: u64 = self.size();
        if offset >= size {
            return Ok(Vec::new());
        }
        let want: u64 = (len as u64).min(size - offset);

        match self {
            Content::Lazy { store, blob, .. } => store.read_blob_range(blob, offset, want).await,
            Content::Disk { file, .. } => {
                use std::os::unix::fs::FileExt;
                let mut buf: Vec<u8> = vec![0u8; want as usize];
                file.read_exact_at(&mut buf, offset)?;
                Ok(buf)
            }
        }
    }

    /// Read the whole content, in chunks so length is never narrowed.
    pub async fn read_all(&self) -> Result<Vec<u8>, VfsError> {
        self.read_all_chunked(READ_ALL_CHUNK).await
    }

    async fn read_all_chunked(&self, chunk: u32) -> Result<Vec<u8>, VfsError> {
        let size: u64 = self.size();
        let mut data: Vec<u8> = Vec::with_capacity(size.min(isize::MAX as u64) as usize);
        while (data.len() as u64) < size {
            let offset: u64 = data.len() as u64;
            let part: Vec<u8> = self.read_at(offset, chunk).await?;
            if part.is_empty() {
                return Err(VfsError::Truncated {
                    id: match self {
                        Content::Lazy { blob, .. } => blob.to_string(),
                        Content::Disk { .. } => "scratch".to_string(),
                    },
                    expected: size,
                    actual: offset,
                });
            }
            data.extend_from_slice(&part);
        }
        Ok(data)
    }
}
