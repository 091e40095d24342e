use nimbus_core::Query;
use nimbus_fs::schema::{CHUNKS, FILE_BUFFERS};
use nimbus_fs::{Access, Ctx, FsError, Mode, NameCollation, NodeKind, Pool, PoolConfig};
use nimbus_store_memory::MemoryRowStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

async fn setup(config: PoolConfig) -> (Pool, Ctx) {
    let _ = env_logger::builder().is_test(true).try_init();
    let pool = Pool::open(Arc::new(MemoryRowStore::new()), config)
        .await
        .expect("open pool");
    pool.register_principal("u1", b"u1 secret")
        .await
        .expect("register");
    let ctx = Ctx::new(pool.unlock("u1", b"u1 secret").await.expect("unlock"));
    (pool, ctx)
}

async fn count_rows(pool: &Pool, table: &'static str) -> usize {
    pool.queue()
        .run(&CancellationToken::new(), move |txn| async move {
            Ok(txn.store().query(table, &Query::all()).await?.len())
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn sibling_names_are_unique_under_the_collation() {
    let (pool, ctx) = setup(PoolConfig::default()).await;
    let root = pool.get_root(&ctx).await.unwrap();
    root.create_folder("Docs").await.unwrap();
    root.create_file("docs").await.unwrap();
    assert!(matches!(
        root.create_file("Docs").await,
        Err(FsError::NameConflict(_))
    ));
    assert!(matches!(
        root.create_folder("a/b").await,
        Err(FsError::InvalidName(_))
    ));

    let (pool, ctx) = setup(PoolConfig {
        collation: NameCollation::CaseInsensitive,
        ..PoolConfig::default()
    })
    .await;
    let root = pool.get_root(&ctx).await.unwrap();
    root.create_folder("Docs").await.unwrap();
    assert!(matches!(
        root.create_file("DOCS").await,
        Err(FsError::NameConflict(_))
    ));
    assert_eq!(root.lookup("docs").await.unwrap().name(), "Docs");
}

#[tokio::test]
async fn paths_resolve_segment_by_segment() {
    let (pool, ctx) = setup(PoolConfig::default()).await;
    let root = pool.get_root(&ctx).await.unwrap();
    let a = root.create_folder("a").await.unwrap();
    let b = a.create_folder("b").await.unwrap();
    b.create_file("c.txt").await.unwrap();

    let found = root.get_by_path("/a/b/c.txt").await.unwrap();
    assert_eq!(found.node().kind, NodeKind::File);
    assert!(matches!(
        root.get_by_path("a/missing/c.txt").await,
        Err(FsError::NoSuchFileOrFolder(path)) if path == "/a/missing"
    ));
    assert!(matches!(
        root.get_by_path("a/b/c.txt/d").await,
        Err(FsError::NotAFolder(_))
    ));

    let file = found.into_file().unwrap();
    assert!(matches!(
        pool.tree().scan(&ctx, file.id()).await,
        Err(FsError::NotAFolder(_))
    ));
    let folder = pool.entry(&ctx, b.id()).await.unwrap();
    assert!(folder.into_folder().is_some());
}

#[tokio::test]
async fn scan_lists_live_children_in_name_order() {
    let (pool, ctx) = setup(PoolConfig::default()).await;
    let root = pool.get_root(&ctx).await.unwrap();
    for name in ["charlie", "alpha", "bravo"] {
        root.create_file(name).await.unwrap();
    }
    root.trash("bravo").await.unwrap();
    let names: Vec<String> = root
        .scan()
        .await
        .unwrap()
        .iter()
        .map(|e| e.name().to_owned())
        .collect();
    assert_eq!(names, ["alpha", "charlie"]);
}

#[tokio::test]
async fn symbolic_links_keep_an_encrypted_target() {
    let (pool, ctx) = setup(PoolConfig::default()).await;
    let root = pool.get_root(&ctx).await.unwrap();
    let link = root
        .create_symbolic_link("latest", "reports/2024/q4.pdf")
        .await
        .unwrap();
    assert_eq!(link.kind, NodeKind::SymbolicLink);
    assert_eq!(
        pool.tree().read_link(&ctx, link.id).await.unwrap(),
        "reports/2024/q4.pdf"
    );
    let entry = root.lookup("latest").await.unwrap();
    assert!(entry.clone().into_file().is_none());
    assert!(matches!(
        pool.snapshots().list(&ctx, link.id).await,
        Err(FsError::NotAFile(_))
    ));
}

#[tokio::test]
async fn renames_stay_in_place() {
    let (pool, ctx) = setup(PoolConfig::default()).await;
    let root = pool.get_root(&ctx).await.unwrap();
    root.create_file("old.txt").await.unwrap();
    root.create_file("taken.txt").await.unwrap();

    assert!(matches!(
        root.rename("old.txt", "taken.txt").await,
        Err(FsError::NameConflict(_))
    ));
    let renamed = root.rename("old.txt", "new.txt").await.unwrap();
    assert_eq!(renamed.node().parent_id, Some(root.id()));
    assert!(root.lookup("old.txt").await.is_err());
    assert_eq!(root.current().await.unwrap().id, root.id());
}

#[tokio::test]
async fn trash_and_restore_round_trip() {
    let (pool, ctx) = setup(PoolConfig::default()).await;
    let root = pool.get_root(&ctx).await.unwrap();
    let docs = root.create_folder("docs").await.unwrap();
    let file = docs.create_file("a.txt").await.unwrap();
    let handle = file.open(None, Access::WRITE, Mode::empty()).await.unwrap();
    handle.write(b"keep me").await.unwrap();
    handle.close().await.unwrap();

    let trashed = root.trash("docs").await.unwrap();
    assert!(trashed.is_trashed());
    assert_eq!(trashed.trash_origin_id, Some(root.id()));
    assert!(root.lookup("docs").await.is_err());
    assert!(matches!(
        docs.create_file("b.txt").await,
        Err(FsError::InvalidParent(_))
    ));
    assert!(matches!(
        pool.trash().trash(&ctx, docs.id()).await,
        Err(FsError::InvalidParent(_))
    ));

    let listed = pool.trash().list(&ctx).await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, docs.id());

    // Trashed content stays readable through a fresh session.
    let fresh = Ctx::new(pool.unlock("u1", b"u1 secret").await.unwrap());
    let entry = pool.entry(&fresh, file.id()).await.unwrap().into_file().unwrap();
    let reader = entry.open(None, Access::READ, Mode::empty()).await.unwrap();
    assert_eq!(reader.read(64).await.unwrap(), b"keep me");
    reader.close().await.unwrap();

    let restored = pool.trash().restore(&ctx, docs.id()).await.unwrap();
    assert!(!restored.is_trashed());
    assert_eq!(restored.parent_id, Some(root.id()));
    assert!(pool.trash().list(&ctx).await.unwrap().is_empty());
    let again = root.get_by_path("docs/a.txt").await.unwrap();
    assert_eq!(again.node().id, file.id());
}

#[tokio::test]
async fn restore_falls_back_to_the_root_and_detects_conflicts() {
    let (pool, ctx) = setup(PoolConfig::default()).await;
    let root = pool.get_root(&ctx).await.unwrap();
    let outer = root.create_folder("outer").await.unwrap();
    let inner = outer.create_file("inner.txt").await.unwrap();

    outer.trash("inner.txt").await.unwrap();
    root.trash("outer").await.unwrap();
    let restored = pool.trash().restore(&ctx, inner.id()).await.unwrap();
    assert_eq!(restored.parent_id, Some(root.id()));

    root.create_folder("outer").await.unwrap();
    assert!(matches!(
        pool.trash().restore(&ctx, outer.id()).await,
        Err(FsError::NameConflict(_))
    ));
    assert!(matches!(
        pool.trash().restore(&ctx, inner.id()).await,
        Err(FsError::InvalidParent(_))
    ));
}

#[tokio::test]
async fn purge_reclaims_the_whole_subtree() {
    let (pool, ctx) = setup(PoolConfig {
        chunk_size: 4,
        ..PoolConfig::default()
    })
    .await;
    let root = pool.get_root(&ctx).await.unwrap();
    let folder = root.create_folder("big").await.unwrap();
    let nested = folder.create_folder("nested").await.unwrap();
    for (parent, name) in [(&folder, "one"), (&nested, "two")] {
        let file = parent.create_file(name).await.unwrap();
        let handle = file.open(None, Access::WRITE, Mode::empty()).await.unwrap();
        handle.write(b"0123456789").await.unwrap();
        handle.close().await.unwrap();
    }
    assert_eq!(count_rows(&pool, FILE_BUFFERS).await, 6);
    let nodes_before = count_rows(&pool, "nodes").await;

    assert!(matches!(
        pool.trash().purge(&ctx, folder.id()).await,
        Err(FsError::InvalidParent(_))
    ));
    root.trash("big").await.unwrap();
    assert_eq!(pool.trash().purge(&ctx, folder.id()).await.unwrap(), 4);

    assert_eq!(count_rows(&pool, FILE_BUFFERS).await, 0);
    assert_eq!(count_rows(&pool, CHUNKS).await, 0);
    assert_eq!(count_rows(&pool, "nodes").await, nodes_before - 4);
    assert!(matches!(
        pool.tree().stat(&ctx, nested.id()).await,
        Err(FsError::NoSuchFileOrFolder(_))
    ));
}

#[tokio::test]
async fn purge_waits_for_open_handles_in_the_subtree() {
    let (pool, ctx) = setup(PoolConfig::default()).await;
    let root = pool.get_root(&ctx).await.unwrap();
    let folder = root.create_folder("busy").await.unwrap();
    let file = folder.create_file("open.txt").await.unwrap();
    let handle = file.open(None, Access::WRITE, Mode::empty()).await.unwrap();
    handle.write(b"still here").await.unwrap();
    handle.sync().await.unwrap();
    root.trash("busy").await.unwrap();

    assert!(matches!(
        pool.trash().purge(&ctx, folder.id()).await,
        Err(FsError::SharingViolation(_))
    ));
    assert!(matches!(
        pool.trash().empty(&ctx).await,
        Err(FsError::SharingViolation(_))
    ));
    assert_eq!(pool.trash().list(&ctx).await.unwrap().len(), 1);
    assert_eq!(count_rows(&pool, FILE_BUFFERS).await, 1);

    handle.close().await.unwrap();
    assert_eq!(pool.trash().purge(&ctx, folder.id()).await.unwrap(), 2);
    assert_eq!(count_rows(&pool, FILE_BUFFERS).await, 0);
}

#[tokio::test]
async fn empty_trash_purges_every_item() {
    let (pool, ctx) = setup(PoolConfig::default()).await;
    let root = pool.get_root(&ctx).await.unwrap();
    for name in ["x", "y", "z"] {
        root.create_file(name).await.unwrap();
        root.trash(name).await.unwrap();
    }
    assert_eq!(pool.trash().list(&ctx).await.unwrap().len(), 3);
    assert_eq!(pool.trash().empty(&ctx).await.unwrap(), 3);
    assert!(pool.trash().list(&ctx).await.unwrap().is_empty());
}

#[tokio::test]
async fn shared_chunks_survive_until_their_last_snapshot_goes() {
    let (pool, ctx) = setup(PoolConfig {
        chunk_size: 4,
        ..PoolConfig::default()
    })
    .await;
    let root = pool.get_root(&ctx).await.unwrap();
    let file = root.create_file("shared.bin").await.unwrap();
    let handle = file.open(None, Access::WRITE, Mode::empty()).await.unwrap();
    handle.write(b"AAAABBBB").await.unwrap();
    handle.close().await.unwrap();
    let s1 = file.list_snapshots().await.unwrap()[0].id;
    assert_eq!(count_rows(&pool, FILE_BUFFERS).await, 2);

    let s2 = file.create_snapshot(Some(s1)).await.unwrap();
    assert_eq!(count_rows(&pool, CHUNKS).await, 4);
    assert_eq!(count_rows(&pool, FILE_BUFFERS).await, 2);
    file.delete_snapshot(s2.id).await.unwrap();
    assert_eq!(count_rows(&pool, CHUNKS).await, 2);
    assert_eq!(count_rows(&pool, FILE_BUFFERS).await, 2);

    let s3 = file.create_snapshot(Some(s1)).await.unwrap();
    let writer = file
        .open(Some(s3.id), Access::WRITE, Mode::empty())
        .await
        .unwrap();
    writer.write(b"CCCC").await.unwrap();
    writer.close().await.unwrap();
    assert_eq!(count_rows(&pool, FILE_BUFFERS).await, 3);

    file.delete_snapshot(s1).await.unwrap();
    assert_eq!(count_rows(&pool, FILE_BUFFERS).await, 2);
    let snapshots = file.list_snapshots().await.unwrap();
    assert_eq!(snapshots.len(), 1);
    assert_eq!(snapshots[0].base_snapshot_id, None);

    let reader = file.open(None, Access::READ, Mode::empty()).await.unwrap();
    assert_eq!(reader.read(8).await.unwrap(), b"CCCCBBBB");
    reader.close().await.unwrap();

    file.delete_snapshot(s3.id).await.unwrap();
    assert_eq!(count_rows(&pool, FILE_BUFFERS).await, 0);
    assert_eq!(count_rows(&pool, CHUNKS).await, 0);
}
