//! Conformance suite for `RowStore` implementations.
//!
//! # Usage
//!
//! In your store crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! nimbus_core = { workspace = true, features = ["testutil"] }
//! ```
//!
//! In your test file:
//!
//! ```ignore
//! use nimbus_core::testutil::RowStoreTests;
//!
//! #[tokio::test]
//! async fn test_my_store() {
//!     let store = MyStore::new(...);
//!     RowStoreTests::new(&store).run_all().await.unwrap();
//! }
//! ```

use crate::fields;
use crate::row::{Filter, Query, Value};
use crate::store::{RowStore, StoreError, StoreResult};
use rand::Rng;

/// Runs the behaviour every backend must share against one store.
pub struct RowStoreTests<'a, S> {
    store: &'a S,
    /// Prefix for test tables to avoid conflicts
    prefix: String,
}

impl<'a, S: RowStore> RowStoreTests<'a, S> {
    pub fn new(store: &'a S) -> Self {
        let prefix = format!("_test_{}_", rand::rng().random::<u32>());
        Self { store, prefix }
    }

    fn table(&self, name: &str) -> String {
        format!("{}{}", self.prefix, name)
    }

    pub async fn run_all(&self) -> StoreResult<()> {
        self.test_insert_get().await?;
        self.test_ids_monotonic().await?;
        self.test_update_merges().await?;
        self.test_delete_filter().await?;
        self.test_query_order_limit().await?;
        self.test_rollback().await?;
        self.test_requires_transaction().await?;
        Ok(())
    }

    pub async fn test_insert_get(&self) -> StoreResult<()> {
        let table = self.table("insert");
        self.store.begin().await?;
        let id = self
            .store
            .insert(&table, fields! { "name" => "a", "blob" => vec![1u8, 2, 3] })
            .await?;
        self.store.commit().await?;

        let row = self.store.get(&table, id).await?.expect("row must exist");
        assert_eq!(row.text("name")?, "a");
        assert_eq!(row.bytes("blob")?, &[1, 2, 3]);
        assert!(self.store.get(&table, id + 1000).await?.is_none());
        Ok(())
    }

    pub async fn test_ids_monotonic(&self) -> StoreResult<()> {
        let table = self.table("ids");
        self.store.begin().await?;
        let a = self.store.insert(&table, fields! {}).await?;
        let b = self.store.insert(&table, fields! {}).await?;
        self.store.delete(&table, &Filter::Id(b)).await?;
        let c = self.store.insert(&table, fields! {}).await?;
        self.store.commit().await?;
        assert!(a < b && b < c, "ids must increase and never be reused");
        Ok(())
    }

    pub async fn test_update_merges(&self) -> StoreResult<()> {
        let table = self.table("update");
        self.store.begin().await?;
        let id = self
            .store
            .insert(&table, fields! { "a" => 1i64, "b" => 2i64 })
            .await?;
        self.store.update(&table, id, fields! { "b" => 5i64 }).await?;
        let missing = self.store.update(&table, id + 99, fields! {}).await;
        assert!(matches!(missing, Err(StoreError::NotFound { .. })));
        self.store.commit().await?;

        let row = self.store.get(&table, id).await?.expect("row");
        assert_eq!(row.int("a")?, 1);
        assert_eq!(row.int("b")?, 5);
        Ok(())
    }

    pub async fn test_delete_filter(&self) -> StoreResult<()> {
        let table = self.table("delete");
        self.store.begin().await?;
        for i in 0..5i64 {
            self.store
                .insert(&table, fields! { "group" => i % 2, "i" => i })
                .await?;
        }
        let removed = self
            .store
            .delete(&table, &Filter::eq("group", 0i64))
            .await?;
        self.store.commit().await?;
        assert_eq!(removed, 3);

        let rest = self.store.query(&table, &Query::all()).await?;
        assert_eq!(rest.len(), 2);
        assert!(rest.iter().all(|r| r.int("group").ok() == Some(1)));
        Ok(())
    }

    pub async fn test_query_order_limit(&self) -> StoreResult<()> {
        let table = self.table("query");
        self.store.begin().await?;
        for name in ["c", "a", "d", "b"] {
            self.store
                .insert(&table, fields! { "name" => name, "parent" => Value::Null })
                .await?;
        }
        self.store.commit().await?;

        let rows = self
            .store
            .query(
                &table,
                &Query::new(Filter::is_null("parent"))
                    .order_by("name")
                    .offset(1)
                    .limit(2),
            )
            .await?;
        let names: Vec<&str> = rows.iter().map(|r| r.text("name").unwrap()).collect();
        assert_eq!(names, vec!["b", "c"]);

        let newest = self
            .store
            .query(&table, &Query::all().order_by_desc("name").limit(1))
            .await?;
        assert_eq!(newest[0].text("name")?, "d");
        Ok(())
    }

    pub async fn test_rollback(&self) -> StoreResult<()> {
        let table = self.table("rollback");
        self.store.begin().await?;
        let id = self.store.insert(&table, fields! { "v" => 1i64 }).await?;
        self.store.commit().await?;

        self.store.begin().await?;
        self.store.update(&table, id, fields! { "v" => 2i64 }).await?;
        self.store.insert(&table, fields! { "v" => 3i64 }).await?;
        self.store.rollback().await?;

        let rows = self.store.query(&table, &Query::all()).await?;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].int("v")?, 1);
        Ok(())
    }

    pub async fn test_requires_transaction(&self) -> StoreResult<()> {
        let table = self.table("notx");
        let res = self.store.insert(&table, fields! {}).await;
        assert!(matches!(res, Err(StoreError::NoTransaction)));
        let res = self.store.commit().await;
        assert!(matches!(res, Err(StoreError::NoTransaction)));
        Ok(())
    }
}
