use nimbus_core::testutil::RowStoreTests;
use nimbus_core::{Filter, Query, RowStore, fields};
use nimbus_store_redb::RedbRowStore;
use tempfile::tempdir;

#[tokio::test(flavor = "multi_thread")]
async fn redb_store_passes_conformance_suite() {
    let dir = tempdir().unwrap();
    let store = RedbRowStore::open(dir.path()).unwrap();
    RowStoreTests::new(&store).run_all().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn committed_rows_survive_reopen() {
    let dir = tempdir().unwrap();
    let (kept, deleted) = {
        let store = RedbRowStore::open(dir.path()).unwrap();
        store.begin().await.unwrap();
        let kept = store
            .insert("nodes", fields! { "name" => "docs", "payload" => vec![7u8; 4] })
            .await
            .unwrap();
        let deleted = store.insert("nodes", fields! { "name" => "tmp" }).await.unwrap();
        store.commit().await.unwrap();

        store.begin().await.unwrap();
        store.delete("nodes", &Filter::Id(deleted)).await.unwrap();
        store
            .update("nodes", kept, fields! { "name" => "documents" })
            .await
            .unwrap();
        store.commit().await.unwrap();

        // Rolled back work must never reach the database.
        store.begin().await.unwrap();
        store.insert("nodes", fields! { "name" => "ghost" }).await.unwrap();
        store.rollback().await.unwrap();
        (kept, deleted)
    };

    let store = RedbRowStore::open(dir.path()).unwrap();
    let rows = store.query("nodes", &Query::all()).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].id, kept);
    assert_eq!(rows[0].text("name").unwrap(), "documents");
    assert_eq!(rows[0].bytes("payload").unwrap(), &[7u8; 4]);

    // Id counters are persisted, so a deleted row id is never handed out again.
    store.begin().await.unwrap();
    let fresh = store.insert("nodes", fields! {}).await.unwrap();
    store.commit().await.unwrap();
    assert!(fresh > deleted);
}

#[tokio::test(flavor = "multi_thread")]
async fn open_transaction_sees_its_own_changes_over_committed_rows() {
    let dir = tempdir().unwrap();
    let store = RedbRowStore::open(dir.path()).unwrap();
    store.begin().await.unwrap();
    let a = store.insert("chunks", fields! { "idx" => 0i64 }).await.unwrap();
    let b = store.insert("chunks", fields! { "idx" => 1i64 }).await.unwrap();
    store.commit().await.unwrap();

    store.begin().await.unwrap();
    store
        .update("chunks", a, fields! { "idx" => 5i64 })
        .await
        .unwrap();
    store.delete("chunks", &Filter::Id(b)).await.unwrap();
    let c = store.insert("chunks", fields! { "idx" => 2i64 }).await.unwrap();

    let seen = store
        .query("chunks", &Query::all().order_by("idx"))
        .await
        .unwrap();
    let ids: Vec<u64> = seen.iter().map(|r| r.id).collect();
    assert_eq!(ids, vec![c, a]);
    assert!(store.get("chunks", b).await.unwrap().is_none());
    let ge = store
        .query("chunks", &Query::new(Filter::ge("idx", 3i64)))
        .await
        .unwrap();
    assert_eq!(ge.len(), 1);
    assert_eq!(ge[0].int("idx").unwrap(), 5);
    store.rollback().await.unwrap();

    // Nothing from the rolled back transaction is visible, but its id stays
    // burnt.
    let rows = store.query("chunks", &Query::all()).await.unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].int("idx").unwrap(), 0);
    store.begin().await.unwrap();
    let d = store.insert("chunks", fields! {}).await.unwrap();
    store.commit().await.unwrap();
    assert!(d > c);
}

#[tokio::test(flavor = "multi_thread")]
async fn ids_continue_after_reopen_even_without_a_counter_update() {
    let dir = tempdir().unwrap();
    let last = {
        let store = RedbRowStore::open(dir.path()).unwrap();
        store.begin().await.unwrap();
        store.insert("keys", fields! {}).await.unwrap();
        let last = store.insert("keys", fields! {}).await.unwrap();
        store.commit().await.unwrap();
        last
    };
    let store = RedbRowStore::open(dir.path()).unwrap();
    store.begin().await.unwrap();
    store
        .update("keys", last, fields! { "wrapped" => vec![1u8] })
        .await
        .unwrap();
    store.commit().await.unwrap();
    store.begin().await.unwrap();
    let next = store.insert("keys", fields! {}).await.unwrap();
    store.commit().await.unwrap();
    assert_eq!(next, last + 1);
}
