use nimbus_core::testutil::RowStoreTests;
use nimbus_store_memory::MemoryRowStore;

#[tokio::test]
async fn memory_store_passes_conformance_suite() {
    let store = MemoryRowStore::new();
    RowStoreTests::new(&store).run_all().await.unwrap();
}
