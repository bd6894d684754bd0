//! Mount session assembly and supervision.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fuser::MountOption;
use tracing::{error, info};

use crate::error::VfsError;
use crate::fuse::GitFs;
use crate::materialize::{Materializer, Strategy};
use crate::object::ObjectStore;
use crate::options::MountOptions;
use crate::tree::TreeFs;
use crate::union::{DeletionTracker, UnionFs, UpperLayer};

/// Assemble the union for one mount session.
///
/// Resolves the revision once; the lower layer stays pinned to that
/// snapshot for the life of the mount.
///
/// # Arguments
/// * `store` - Object store backend
/// * `revision` - Revision identifier to mount
/// * `upper_dir` - Directory holding the writable layer, created if
///   absent
/// * `options` - Mount configuration
pub async fn build_union(
    store: Arc<dyn ObjectStore>,
    revision: &str,
    upper_dir: &Path,
    options: &MountOptions,
) -> Result<Arc<UnionFs>, VfsError> {
    let materializer: Materializer = match options.strategy {
        Strategy::Lazy => Materializer::lazy(store.clone()),
        Strategy::Disk => {
            let root: std::path::PathBuf = options
                .scratch_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir);
            Materializer::disk(store.clone(), &root)?
        }
    };

    let lower: TreeFs = TreeFs::open(store, revision, materializer).await?;
    let upper: UpperLayer = UpperLayer::open(upper_dir, options.deletion_dirname.clone())?;
    let deleted: DeletionTracker = DeletionTracker::open(
        upper_dir.join(&options.deletion_dirname),
        options.delete_ttl,
    )?;

    Ok(Arc::new(UnionFs::new(
        lower,
        upper,
        deleted,
        options.branch_ttl,
        options.negative_ttl,
    )))
}

fn mount_options(options: &MountOptions) -> Vec<MountOption> {
    vec![
        MountOption::FSName(options.fsname.clone()),
        MountOption::DefaultPermissions,
        MountOption::AutoUnmount,
    ]
}

/// Mount and serve until the filesystem is unmounted externally.
///
/// # Arguments
/// * `fs` - The FUSE bridge to serve
/// * `mountpoint` - Path to mount at
/// * `options` - Mount configuration
pub fn mount(fs: GitFs, mountpoint: &Path, options: &MountOptions) -> Result<(), VfsError> {
    fuser::mount2(fs, mountpoint, &mount_options(options))
        .map_err(|e| VfsError::MountFailed(e.to_string()))
}

/// Spawn a mount in the background.
///
/// # Returns
/// Background session handle; dropping it unmounts.
pub fn spawn_mount(
    fs: GitFs,
    mountpoint: &Path,
    options: &MountOptions,
) -> Result<fuser::BackgroundSession, VfsError> {
    fuser::spawn_mount2(fs, mountpoint, &mount_options(options))
        .map_err(|e| VfsError::MountFailed(e.to_string()))
}

/// Best-effort unmount of a stale mount left behind by a previous
/// crashed session. Errors are ignored; a fresh mountpoint makes the
/// command fail harmlessly.
pub fn cleanup_stale_mount(mountpoint: &Path) {
    let status = std::process::Command::new("fusermount")
        .arg("-uz")
        .arg(mountpoint)
        .status();
    if matches!(status, Ok(s) if s.success()) {
        info!(mountpoint = %mountpoint.display(), "unmounted stale mount");
    }
}

/// Serve a mount until `shutdown` is raised, then unmount under a
/// deadline.
///
/// A stuck unmount (an open file pinning the mount, a hung kernel
/// request) would otherwise block process exit forever; after the grace
/// period the process is terminated with a nonzero status instead.
///
/// # Arguments
/// * `fs` - The FUSE bridge to serve
/// * `mountpoint` - Path to mount at
/// * `options` - Mount configuration; `unmount_grace` bounds teardown
/// * `shutdown` - Raised by the caller (typically a signal handler) to
///   request unmount
pub fn serve(
    fs: GitFs,
    mountpoint: &Path,
    options: &MountOptions,
    shutdown: Arc<AtomicBool>,
) -> Result<(), VfsError> {
    cleanup_stale_mount(mountpoint);
    let session: fuser::BackgroundSession = spawn_mount(fs, mountpoint, options)?;
    info!(mountpoint = %mountpoint.display(), "mounted");

    let grace: Duration = options.unmount_grace;
    supervise(session, &shutdown, grace, move || {
        error!(grace_secs = grace.as_secs_f64(), "unmount did not finish in time");
        std::process::exit(1);
    });
    info!("unmounted");
    Ok(())
}

/// Wait for `shutdown`, then tear the session down under `grace`.
///
/// Dropping the session performs the unmount. A watchdog thread invokes
/// `hard_exit` if teardown has not completed when the grace period ends.
fn supervise<S>(
    session: S,
    shutdown: &AtomicBool,
    grace: Duration,
    hard_exit: impl FnOnce() + Send + 'static,
) {
    while !shutdown.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
    }
    info!("unmount requested");

    let done: Arc<AtomicBool> = Arc::new(AtomicBool::new(false));
    let watchdog_done: Arc<AtomicBool> = done.clone();
    std::thread::spawn(move || {
        std::thread::sleep(grace);
        if !watchdog_done.load(Ordering::SeqCst) {
            hard_exit();
        }
    });

    drop(session);
    done.store(true, Ordering::SeqCst);
}
