//! In-memory `RowStore`. Nothing survives a restart; used by tests and
//! ephemeral pools.

use std::sync::{Mutex, MutexGuard};

use nimbus_core::{
    Fields, Filter, Query, Record, RowId, RowStore, StoreError, StoreResult, TableSet,
};

#[derive(Debug, Default)]
pub struct MemoryRowStore {
    tables: Mutex<TableSet>,
}

impl MemoryRowStore {
    /// Creates a new, empty `MemoryRowStore`.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, TableSet>> {
        self.tables
            .lock()
            .map_err(|_| StoreError::Other(anyhow::anyhow!("memory store lock poisoned")))
    }
}

#[async_trait::async_trait]
impl RowStore for MemoryRowStore {
    async fn begin(&self) -> StoreResult<()> {
        self.lock()?.begin()
    }

    async fn commit(&self) -> StoreResult<()> {
        self.lock()?.commit().map(|_| ())
    }

    async fn rollback(&self) -> StoreResult<()> {
        self.lock()?.rollback()
    }

    async fn insert(&self, table: &str, fields: Fields) -> StoreResult<RowId> {
        self.lock()?.insert(table, fields)
    }

    async fn update(&self, table: &str, id: RowId, fields: Fields) -> StoreResult<()> {
        self.lock()?.update(table, id, fields)
    }

    async fn delete(&self, table: &str, filter: &Filter) -> StoreResult<u64> {
        self.lock()?.delete(table, filter)
    }

    async fn query(&self, table: &str, query: &Query) -> StoreResult<Vec<Record>> {
        Ok(self.lock()?.query(table, query))
    }
}
