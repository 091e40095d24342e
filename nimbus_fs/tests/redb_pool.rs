use nimbus_fs::{Access, Ctx, FsError, Mode, Pool, PoolConfig};
use nimbus_store_redb::RedbRowStore;
use std::sync::Arc;
use tempfile::tempdir;

#[tokio::test]
async fn content_survives_reopening_the_database() {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempdir().expect("tmp");
    let path = dir.path().join("pool");
    let config = PoolConfig {
        chunk_size: 1024,
        ..PoolConfig::default()
    };

    {
        let store = Arc::new(RedbRowStore::open(&path).expect("open redb"));
        let pool = Pool::open(store, config.clone()).await.unwrap();
        pool.register_principal("u1", b"u1 secret").await.unwrap();
        let ctx = Ctx::new(pool.unlock("u1", b"u1 secret").await.unwrap());
        let root = pool.get_root(&ctx).await.unwrap();
        let docs = root.create_folder("docs").await.unwrap();
        let file = docs.create_file("big.bin").await.unwrap();
        let handle = file.open(None, Access::WRITE, Mode::empty()).await.unwrap();
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        handle.write(&data).await.unwrap();
        handle.close().await.unwrap();
        pool.shutdown().await.unwrap();
    }

    let store = Arc::new(RedbRowStore::open(&path).expect("reopen redb"));
    let pool = Pool::open(store, config).await.unwrap();
    assert!(matches!(
        pool.unlock("u1", b"not the secret").await,
        Err(FsError::AccessDenied(_))
    ));
    let ctx = Ctx::new(pool.unlock("u1", b"u1 secret").await.unwrap());
    let root = pool.get_root(&ctx).await.unwrap();
    let file = root
        .get_by_path("docs/big.bin")
        .await
        .unwrap()
        .into_file()
        .unwrap();
    let reader = file.open(None, Access::READ, Mode::empty()).await.unwrap();
    reader.seek(4000).await.unwrap();
    let tail = reader.read(2000).await.unwrap();
    let expected: Vec<u8> = (4000..5000u32).map(|i| (i % 251) as u8).collect();
    assert_eq!(tail, expected);
    assert_eq!(reader.position().await.unwrap(), 5000);
}
