use nimbus_core::{Query, fields};
use nimbus_fs::schema::{KEYS, KeyId, KeyKind, KeyRecord, WrappedBy};
use nimbus_fs::vault;
use nimbus_fs::{Access, AccessLevel, Anchor, Ctx, FsError, Mode, Pool, PoolConfig};
use nimbus_store_memory::MemoryRowStore;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

async fn setup() -> Pool {
    let _ = env_logger::builder().is_test(true).try_init();
    let pool = Pool::open(Arc::new(MemoryRowStore::new()), PoolConfig::default())
        .await
        .expect("open pool");
    for name in ["u1", "u2", "u3"] {
        pool.register_principal(name, format!("{name} secret").as_bytes())
            .await
            .expect("register");
    }
    pool
}

async fn login(pool: &Pool, name: &str) -> Ctx {
    Ctx::new(
        pool.unlock(name, format!("{name} secret").as_bytes())
            .await
            .expect("unlock"),
    )
}

#[tokio::test]
async fn fresh_sessions_unwrap_the_creation_key() {
    let pool = setup().await;
    let creator = login(&pool, "u1").await;
    let mut folder = pool.get_root(&creator).await.unwrap();
    for depth in 0..5 {
        folder = folder.create_folder(&format!("level{depth}")).await.unwrap();
    }
    let file = folder.create_file("deep.txt").await.unwrap();
    let at_creation = pool
        .vault()
        .resolve_chain(&creator, file.id())
        .await
        .unwrap();

    let later = login(&pool, "u1").await;
    assert_eq!(later.session().cached_key_count(), 1);
    let resolved = pool.vault().resolve_chain(&later, file.id()).await.unwrap();
    assert_eq!(resolved.level, AccessLevel::Owner);
    assert!(matches!(resolved.anchor, Anchor::Root(_)));
    assert_eq!(
        resolved.key.as_symmetric().unwrap(),
        at_creation.key.as_symmetric().unwrap()
    );
    // root key + root folder + five folders + the file
    assert_eq!(later.session().cached_key_count(), 8);
}

#[tokio::test]
async fn moved_nodes_are_rewrapped_under_the_new_parent() {
    let pool = setup().await;
    let ctx = login(&pool, "u1").await;
    let root = pool.get_root(&ctx).await.unwrap();
    let a = root.create_folder("a").await.unwrap();
    let b = root.create_folder("b").await.unwrap();
    let file = a.create_file("f.txt").await.unwrap();
    let handle = file.open(None, Access::WRITE, Mode::empty()).await.unwrap();
    handle.write(b"payload").await.unwrap();
    handle.close().await.unwrap();

    let moved = a.move_to("f.txt", &b, Some("g.txt")).await.unwrap();
    assert_eq!(moved.name(), "g.txt");
    assert_eq!(moved.node().parent_id, Some(b.id()));

    let key_id = moved.node().key_id;
    let b_key = b.node().key_id;
    let wrapped_by = pool
        .queue()
        .run(&CancellationToken::new(), move |txn| async move {
            let record = txn.store().get(KEYS, key_id.0).await?.expect("key row");
            Ok(record.opt_uint("wrapped_by_key")?)
        })
        .await
        .unwrap();
    assert_eq!(wrapped_by, Some(b_key.0));

    let fresh = login(&pool, "u1").await;
    let root = pool.get_root(&fresh).await.unwrap();
    let file = root
        .get_by_path("b/g.txt")
        .await
        .unwrap()
        .into_file()
        .unwrap();
    let reader = file.open(None, Access::READ, Mode::empty()).await.unwrap();
    assert_eq!(reader.read(64).await.unwrap(), b"payload");
    assert!(matches!(
        root.get_by_path("a/f.txt").await,
        Err(FsError::NoSuchFileOrFolder(_))
    ));
}

#[tokio::test]
async fn the_old_parent_key_no_longer_unwraps_a_moved_node() {
    let pool = setup().await;
    let ctx = login(&pool, "u1").await;
    let root = pool.get_root(&ctx).await.unwrap();
    let a = root.create_folder("a").await.unwrap();
    let b = root.create_folder("b").await.unwrap();
    a.create_file("f.txt").await.unwrap();
    let moved = a.move_to("f.txt", &b, None).await.unwrap();
    let old_parent = pool.vault().resolve_chain(&ctx, a.id()).await.unwrap();

    let key_id = moved.node().key_id;
    let record = pool
        .queue()
        .run(&CancellationToken::new(), move |txn| async move {
            let row = txn.store().get(KEYS, key_id.0).await?.expect("key row");
            Ok(KeyRecord {
                id: key_id,
                kind: KeyKind::Node,
                public_key: None,
                wrapped_secret: row.bytes("wrapped_secret")?.to_vec(),
                wrapped_by: WrappedBy::Key(KeyId(row.uint("wrapped_by_key")?)),
            })
        })
        .await
        .unwrap();

    let err = vault::unwrap(&old_parent.key, &record).unwrap_err();
    assert!(matches!(err, FsError::WrongWrappingKey { .. }));
    assert!(err.is_integrity_violation());

    // Forging the parent reference still fails authentication.
    let forged = KeyRecord {
        wrapped_by: WrappedBy::Key(old_parent.key.id),
        ..record
    };
    let err = vault::unwrap(&old_parent.key, &forged).unwrap_err();
    assert!(matches!(err, FsError::KeyDerivation(_)));
}

#[tokio::test]
async fn tampered_key_material_is_an_integrity_violation() {
    let pool = setup().await;
    let ctx = login(&pool, "u1").await;
    let root = pool.get_root(&ctx).await.unwrap();
    let file = root.create_file("secret.txt").await.unwrap();
    let handle = file.open(None, Access::WRITE, Mode::empty()).await.unwrap();
    handle.write(b"payload").await.unwrap();
    handle.close().await.unwrap();

    let key_id = file.node().key_id;
    pool.queue()
        .run(&CancellationToken::new(), move |txn| async move {
            let row = txn.store().get(KEYS, key_id.0).await?.expect("key row");
            let mut secret = row.bytes("wrapped_secret")?.to_vec();
            let middle = secret.len() / 2;
            secret[middle] ^= 0x5a;
            txn.store()
                .update(KEYS, key_id.0, fields! { "wrapped_secret" => secret })
                .await?;
            Ok(())
        })
        .await
        .unwrap();

    let fresh = login(&pool, "u1").await;
    let err = pool
        .vault()
        .resolve_chain(&fresh, file.id())
        .await
        .unwrap_err();
    assert!(err.is_integrity_violation(), "unexpected error: {err}");

    let root = pool.get_root(&fresh).await.unwrap();
    let file = root
        .get_by_path("secret.txt")
        .await
        .unwrap()
        .into_file()
        .unwrap();
    let err = file
        .open(None, Access::READ, Mode::empty())
        .await
        .unwrap_err();
    assert!(err.is_integrity_violation(), "unexpected error: {err}");
}

#[tokio::test]
async fn folders_cannot_move_into_their_own_subtree() {
    let pool = setup().await;
    let ctx = login(&pool, "u1").await;
    let root = pool.get_root(&ctx).await.unwrap();
    let outer = root.create_folder("outer").await.unwrap();
    let inner = outer.create_folder("inner").await.unwrap();
    assert!(matches!(
        root.move_to("outer", &inner, None).await,
        Err(FsError::InvalidParent(_))
    ));
}

#[tokio::test]
async fn grants_give_exactly_the_granted_level() {
    let pool = setup().await;
    let owner = login(&pool, "u1").await;
    let guest = login(&pool, "u2").await;
    let stranger = login(&pool, "u3").await;

    let root = pool.get_root(&owner).await.unwrap();
    let shared = root.create_folder("shared").await.unwrap();
    let file = shared.create_file("notes.txt").await.unwrap();
    let handle = file.open(None, Access::WRITE, Mode::empty()).await.unwrap();
    handle.write(b"for u2").await.unwrap();
    handle.close().await.unwrap();

    pool.vault()
        .grant_access(&owner, shared.id(), "u2", AccessLevel::Read)
        .await
        .unwrap();
    assert!(matches!(
        pool.vault()
            .grant_access(&owner, shared.id(), "u2", AccessLevel::Owner)
            .await,
        Err(FsError::AccessDenied(_))
    ));

    let visible = pool.vault().shared_with_me(&guest).await.unwrap();
    assert_eq!(visible.len(), 1);
    assert_eq!(visible[0].1.name, "shared");

    let resolved = pool.vault().resolve_chain(&guest, file.id()).await.unwrap();
    assert_eq!(resolved.level, AccessLevel::Read);
    assert!(matches!(resolved.anchor, Anchor::Grant(_)));

    let tree = pool.tree();
    let as_guest = tree.stat(&guest, file.id()).await.unwrap();
    assert_eq!(as_guest.name, "notes.txt");
    assert!(matches!(
        tree.create_file(&guest, shared.id(), "mine.txt").await,
        Err(FsError::AccessDenied(_))
    ));
    assert!(matches!(
        tree.stat(&stranger, file.id()).await,
        Err(FsError::AccessDenied(_))
    ));

    let entries = tree.scan(&guest, shared.id()).await.unwrap();
    assert_eq!(entries.len(), 1);

    let snapshots = pool.snapshots().list(&guest, file.id()).await.unwrap();
    assert_eq!(snapshots.len(), 1);

    let guest_file = pool
        .entry(&guest, file.id())
        .await
        .unwrap()
        .into_file()
        .unwrap();
    assert!(matches!(
        guest_file.open(None, Access::WRITE, Mode::empty()).await,
        Err(FsError::AccessDenied(_))
    ));
    let reader = guest_file.open(None, Access::READ, Mode::empty()).await.unwrap();
    assert_eq!(reader.read(64).await.unwrap(), b"for u2");
    reader.close().await.unwrap();

    pool.vault()
        .grant_access(&owner, shared.id(), "u2", AccessLevel::Write)
        .await
        .unwrap();
    let created = tree.create_file(&guest, shared.id(), "mine.txt").await.unwrap();
    assert_eq!(created.owner_id, owner.session().principal_id());

    assert!(
        pool.vault()
            .revoke_access(&owner, shared.id(), "u2")
            .await
            .unwrap()
    );
    let after = login(&pool, "u2").await;
    assert!(matches!(
        pool.vault().resolve_chain(&after, file.id()).await,
        Err(FsError::AccessDenied(_))
    ));
}

#[tokio::test]
async fn grantees_cannot_trash_shared_nodes() {
    let pool = setup().await;
    let owner = login(&pool, "u1").await;
    let guest = login(&pool, "u2").await;
    let root = pool.get_root(&owner).await.unwrap();
    let shared = root.create_folder("shared").await.unwrap();
    let file = shared.create_file("keep.txt").await.unwrap();
    pool.vault()
        .grant_access(&owner, shared.id(), "u2", AccessLevel::Write)
        .await
        .unwrap();
    assert!(matches!(
        pool.trash().trash(&guest, file.id()).await,
        Err(FsError::AccessDenied(_))
    ));
}

#[tokio::test]
async fn ended_sessions_forget_their_keys() {
    let pool = setup().await;
    let ctx = login(&pool, "u1").await;
    let root = pool.get_root(&ctx).await.unwrap();
    root.create_folder("x").await.unwrap();
    assert!(ctx.session().cached_key_count() > 0);

    ctx.session().end();
    assert!(ctx.session().is_ended());
    assert_eq!(ctx.session().cached_key_count(), 0);
    assert!(root.scan().await.is_err());
}

#[tokio::test]
async fn cancelled_contexts_do_not_touch_the_store() {
    let pool = setup().await;
    let ctx = login(&pool, "u1").await;
    let root = pool.get_root(&ctx).await.unwrap();

    let call = ctx.child();
    call.cancel();
    assert!(matches!(
        pool.tree().create_folder(&call, root.id(), "never").await,
        Err(FsError::Cancelled)
    ));
    assert!(matches!(
        root.lookup("never").await,
        Err(FsError::NoSuchFileOrFolder(_))
    ));

    let nodes = pool
        .queue()
        .run(&CancellationToken::new(), |txn| async move {
            Ok(txn.store().query("nodes", &Query::all()).await?.len())
        })
        .await
        .unwrap();
    // root and trash folders of the three principals
    assert_eq!(nodes, 6);
}
