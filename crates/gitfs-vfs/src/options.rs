//! Mount configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::materialize::Strategy;

/// Configuration for one mount session.
#[derive(Debug, Clone)]
pub struct MountOptions {
    /// Filesystem name reported to the kernel.
    pub fsname: String,
    /// How long the kernel may cache entries and attributes.
    pub entry_ttl: Duration,
    /// How long a resolution miss is cached before the layers are
    /// consulted again.
    pub negative_ttl: Duration,
    /// How long cached resolutions and merged listings live.
    pub branch_ttl: Duration,
    /// How long the deletion record snapshot lives.
    pub delete_ttl: Duration,
    /// Content materialization strategy.
    pub strategy: Strategy,
    /// Scratch directory root for the disk strategy; the system
    /// temporary directory when unset.
    pub scratch_dir: Option<PathBuf>,
    /// Name of the deletion record directory inside the upper layer.
    pub deletion_dirname: String,
    /// How long a requested unmount may take before the process is
    /// forcibly terminated.
    pub unmount_grace: Duration,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            fsname: "gitfs".to_string(),
            entry_ttl: Duration::from_secs(1),
            negative_ttl: Duration::from_secs(1),
            branch_ttl: Duration::from_secs(5),
            delete_ttl: Duration::from_secs(5),
            strategy: Strategy::Lazy,
            scratch_dir: None,
            deletion_dirname: ".gitfs-deleted".to_string(),
            unmount_grace: Duration::from_secs(3),
        }
    }
}
