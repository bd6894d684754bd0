//! Lazy versus disk materialization observed through the union.

use std::sync::Arc;
use std::time::Duration;

use gitfs_vfs::{
    build_union, MemoryObjectStore, MountOptions, Strategy, UnionFs,
};

fn sample_store() -> Arc<MemoryObjectStore> {
    let store = Arc::new(MemoryObjectStore::new());
    store.add_file("data.bin", vec![7u8; 4096]);
    store
}

async fn mounted_with(
    store: Arc<MemoryObjectStore>,
    upper: &std::path::Path,
    strategy: Strategy,
    scratch: Option<std::path::PathBuf>,
) -> Arc<UnionFs> {
    let options: MountOptions = MountOptions {
        strategy,
        scratch_dir: scratch,
        branch_ttl: Duration::from_secs(60),
        ..MountOptions::default()
    };
    build_union(store, "HEAD", upper, &options).await.unwrap()
}

#[tokio::test]
async fn lazy_fetches_on_every_open() {
    let store = sample_store();
    let upper = tempfile::TempDir::new().unwrap();
    let fs = mounted_with(store.clone(), upper.path(), Strategy::Lazy, None).await;

    fs.read("data.bin", 0, 16).await.unwrap();
    fs.read("data.bin", 1024, 16).await.unwrap();
    // Each range read reaches the store; nothing is retained locally.
    assert_eq!(store.open_blob_count(), 2);
}

#[tokio::test]
async fn disk_extracts_exactly_once() {
    let store = sample_store();
    let upper = tempfile::TempDir::new().unwrap();
    let scratch = tempfile::TempDir::new().unwrap();
    let fs = mounted_with(
        store.clone(),
        upper.path(),
        Strategy::Disk,
        Some(scratch.path().to_path_buf()),
    )
    .await;

    let (a, b, c, d) = tokio::join!(
        fs.read("data.bin", 0, 64),
        fs.read("data.bin", 512, 64),
        fs.read("data.bin", 1024, 64),
        fs.read("data.bin", 4090, 64),
    );
    assert_eq!(a.unwrap(), vec![7u8; 64]);
    assert_eq!(b.unwrap(), vec![7u8; 64]);
    assert_eq!(c.unwrap(), vec![7u8; 64]);
    // The final read clamps at the end of the file.
    assert_eq!(d.unwrap(), vec![7u8; 6]);

    // Concurrent first opens coordinated on one extraction.
    assert_eq!(store.open_blob_count(), 1);

    // Later reads keep hitting the scratch copy.
    fs.read("data.bin", 2048, 16).await.unwrap();
    assert_eq!(store.open_blob_count(), 1);
}

#[tokio::test]
async fn disk_scratch_lives_under_configured_root() {
    let store = sample_store();
    let upper = tempfile::TempDir::new().unwrap();
    let scratch = tempfile::TempDir::new().unwrap();
    let fs = mounted_with(
        store.clone(),
        upper.path(),
        Strategy::Disk,
        Some(scratch.path().to_path_buf()),
    )
    .await;

    fs.read("data.bin", 0, 16).await.unwrap();

    let sessions: Vec<_> = std::fs::read_dir(scratch.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(sessions.len(), 1);
    let extracted: usize = std::fs::read_dir(sessions[0].path()).unwrap().count();
    assert_eq!(extracted, 1);
}

#[tokio::test]
async fn copied_up_files_bypass_materialization() {
    let store = sample_store();
    let upper = tempfile::TempDir::new().unwrap();
    let fs = mounted_with(store.clone(), upper.path(), Strategy::Lazy, None).await;

    // Copy-up reads the blob once; subsequent reads come from the upper
    // layer without touching the store.
    fs.write("data.bin", 0, b"edited").await.unwrap();
    let calls_after_copy_up: u64 = store.open_blob_count();

    fs.read("data.bin", 0, 16).await.unwrap();
    fs.read("data.bin", 100, 16).await.unwrap();
    assert_eq!(store.open_blob_count(), calls_after_copy_up);
}
