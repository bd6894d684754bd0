//! End-to-end behavior of the merged namespace.

use std::sync::Arc;
use std::time::Duration;

use gitfs_vfs::{
    build_union, EntryKind, Layer, MemoryObjectStore, MountOptions, UnionFs, VfsError,
};

fn sample_store() -> Arc<MemoryObjectStore> {
    let store = Arc::new(MemoryObjectStore::new());
    store.add_file("a.txt", b"alpha".to_vec());
    store.add_file("b.txt", b"beta".to_vec());
    store.add_file("docs/guide.md", b"# guide".to_vec());
    store.add_file("docs/api.md", b"# api".to_vec());
    store.add_symlink("latest", "docs/guide.md");
    store
}

async fn mounted(
    store: Arc<MemoryObjectStore>,
    upper: &std::path::Path,
) -> Arc<UnionFs> {
    let options: MountOptions = MountOptions {
        branch_ttl: Duration::from_secs(60),
        negative_ttl: Duration::from_secs(60),
        ..MountOptions::default()
    };
    build_union(store, "HEAD", upper, &options).await.unwrap()
}

#[tokio::test]
async fn lower_entries_read_through() {
    let upper = tempfile::TempDir::new().unwrap();
    let fs = mounted(sample_store(), upper.path()).await;

    let root = fs.lookup("").await.unwrap();
    assert_eq!(root.kind, EntryKind::Directory);

    assert_eq!(fs.read("a.txt", 0, 100).await.unwrap(), b"alpha".to_vec());
    assert_eq!(fs.read_link("latest").await.unwrap(), "docs/guide.md");
}

#[tokio::test]
async fn delete_then_recreate_yields_upper_entry() {
    let upper = tempfile::TempDir::new().unwrap();
    let fs = mounted(sample_store(), upper.path()).await;

    fs.unlink("a.txt").await.unwrap();
    assert!(fs.lookup("a.txt").await.unwrap_err().is_not_found());

    fs.create_file("a.txt", 0o600).await.unwrap();
    fs.write("a.txt", 0, b"fresh").await.unwrap();

    let attr = fs.lookup("a.txt").await.unwrap();
    assert_eq!(attr.layer, Layer::Upper);
    assert_eq!(attr.perm, 0o600);
    assert_eq!(attr.size, 5);
    assert_eq!(fs.read("a.txt", 0, 100).await.unwrap(), b"fresh".to_vec());
}

#[tokio::test]
async fn copy_up_preserves_unwritten_bytes() {
    let upper = tempfile::TempDir::new().unwrap();
    let fs = mounted(sample_store(), upper.path()).await;

    // Overwrite one byte in the middle; the rest must survive copy-up.
    fs.write("docs/guide.md", 2, b"G").await.unwrap();
    assert_eq!(
        fs.read("docs/guide.md", 0, 100).await.unwrap(),
        b"# Guide".to_vec()
    );
    assert_eq!(fs.lookup("docs/guide.md").await.unwrap().layer, Layer::Upper);

    // The sibling is untouched and still served from the lower tree.
    assert_eq!(fs.lookup("docs/api.md").await.unwrap().layer, Layer::Lower);
}

#[tokio::test]
async fn merged_listing_union_minus_deleted() {
    let upper = tempfile::TempDir::new().unwrap();
    let fs = mounted(sample_store(), upper.path()).await;

    // Lower has {a.txt, b.txt}; upper gains {b.txt (shadow), c.txt};
    // a.txt is deleted. Merged: {b.txt, c.txt} with upper's b.txt.
    fs.write("b.txt", 0, b"shadow").await.unwrap();
    fs.create_file("c.txt", 0o644).await.unwrap();
    fs.unlink("a.txt").await.unwrap();

    let names: Vec<String> = fs
        .list_children("")
        .await
        .unwrap()
        .iter()
        .map(|e| e.name.clone())
        .collect();
    assert_eq!(names, vec!["b.txt", "c.txt", "docs", "latest"]);
    assert_eq!(fs.read("b.txt", 0, 100).await.unwrap(), b"shadow".to_vec());
}

#[tokio::test]
async fn writes_invalidate_caches_within_ttl() {
    let upper = tempfile::TempDir::new().unwrap();
    // Generous TTLs: only explicit invalidation can expose the changes.
    let fs = mounted(sample_store(), upper.path()).await;

    fs.list_children("").await.unwrap();
    let before = fs.lookup("a.txt").await.unwrap();
    assert_eq!(before.size, 5);

    fs.write("a.txt", 5, b" extended").await.unwrap();
    let after = fs.lookup("a.txt").await.unwrap();
    assert_eq!(after.size, 14);

    fs.unlink("b.txt").await.unwrap();
    let names: Vec<String> = fs
        .list_children("")
        .await
        .unwrap()
        .iter()
        .map(|e| e.name.clone())
        .collect();
    assert!(!names.contains(&"b.txt".to_string()));
}

#[tokio::test]
async fn create_succeeds_during_negative_window() {
    let upper = tempfile::TempDir::new().unwrap();
    let fs = mounted(sample_store(), upper.path()).await;

    // Long negative TTL: the miss below stays cached unless creation
    // clears it.
    assert!(fs.lookup("new.txt").await.unwrap_err().is_not_found());
    fs.create_file("new.txt", 0o644).await.unwrap();
    assert_eq!(fs.lookup("new.txt").await.unwrap().size, 0);
}

#[tokio::test]
async fn kind_mismatch_errors() {
    let upper = tempfile::TempDir::new().unwrap();
    let fs = mounted(sample_store(), upper.path()).await;

    assert!(matches!(
        fs.list_children("a.txt").await.unwrap_err(),
        VfsError::NotADirectory(_)
    ));
    assert!(matches!(
        fs.open_for_read("docs").await.unwrap_err(),
        VfsError::IsADirectory(_)
    ));
    assert!(matches!(
        fs.unlink("docs").await.unwrap_err(),
        VfsError::IsADirectory(_)
    ));
    assert!(fs
        .lookup("a.txt/child")
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test]
async fn upper_layer_survives_remount() {
    let store = sample_store();
    let upper = tempfile::TempDir::new().unwrap();

    {
        let fs = mounted(store.clone(), upper.path()).await;
        fs.write("a.txt", 0, b"kept!").await.unwrap();
        fs.unlink("b.txt").await.unwrap();
        fs.mkdir("newdir", 0o755).await.unwrap();
    }

    let fs = mounted(store, upper.path()).await;
    assert_eq!(fs.read("a.txt", 0, 100).await.unwrap(), b"kept!".to_vec());
    assert!(fs.lookup("b.txt").await.unwrap_err().is_not_found());
    assert_eq!(fs.lookup("newdir").await.unwrap().kind, EntryKind::Directory);
}

#[tokio::test]
async fn rename_directory_moves_subtree() {
    let upper = tempfile::TempDir::new().unwrap();
    let fs = mounted(sample_store(), upper.path()).await;

    fs.rename("docs", "manual").await.unwrap();

    assert!(fs.lookup("docs").await.unwrap_err().is_not_found());
    assert!(fs.lookup("docs/guide.md").await.unwrap_err().is_not_found());
    assert_eq!(
        fs.read("manual/guide.md", 0, 100).await.unwrap(),
        b"# guide".to_vec()
    );

    let names: Vec<String> = fs
        .list_children("manual")
        .await
        .unwrap()
        .iter()
        .map(|e| e.name.clone())
        .collect();
    assert_eq!(names, vec!["api.md", "guide.md"]);
}

#[tokio::test]
async fn rename_onto_deleted_directory_revives_moved_children_only() {
    let store = Arc::new(MemoryObjectStore::new());
    store.add_file("src/main.rs", b"fn main() {}".to_vec());
    store.add_file("src/old.rs", b"// retired".to_vec());
    store.add_file("lib/main.rs", b"pub fn lib() {}".to_vec());
    store.add_file("lib/util.rs", b"pub fn util() {}".to_vec());
    let upper = tempfile::TempDir::new().unwrap();
    let fs = mounted(store, upper.path()).await;

    // Empty out src and remove it, then move lib into its place.
    fs.unlink("src/main.rs").await.unwrap();
    fs.unlink("src/old.rs").await.unwrap();
    fs.rmdir("src").await.unwrap();
    fs.rename("lib", "src").await.unwrap();

    // Listing and lookup must agree: the moved children are visible
    // and readable under the new name.
    let names: Vec<String> = fs
        .list_children("src")
        .await
        .unwrap()
        .iter()
        .map(|e| e.name.clone())
        .collect();
    assert_eq!(names, vec!["main.rs", "util.rs"]);
    assert_eq!(
        fs.read("src/main.rs", 0, 100).await.unwrap(),
        b"pub fn lib() {}".to_vec()
    );
    assert_eq!(fs.lookup("src/util.rs").await.unwrap().layer, Layer::Upper);

    // The deleted child the move did not bring along stays gone, and
    // the source name is no longer resolvable.
    assert!(fs.lookup("src/old.rs").await.unwrap_err().is_not_found());
    assert!(fs.lookup("lib").await.unwrap_err().is_not_found());
    assert!(fs.lookup("lib/main.rs").await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn deletion_record_dir_is_hidden() {
    let upper = tempfile::TempDir::new().unwrap();
    let fs = mounted(sample_store(), upper.path()).await;

    fs.unlink("a.txt").await.unwrap();
    let names: Vec<String> = fs
        .list_children("")
        .await
        .unwrap()
        .iter()
        .map(|e| e.name.clone())
        .collect();
    assert!(!names.iter().any(|n| n.contains("deleted")));
}
