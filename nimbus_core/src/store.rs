use async_trait::async_trait;
use thiserror::Error;

use crate::row::{Fields, Filter, Query, Record, RowId};

pub type StoreResult<T, E = StoreError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("row {id} not found in table {table}")]
    NotFound { table: String, id: RowId },
    #[error("no transaction is active")]
    NoTransaction,
    #[error("a transaction is already active")]
    TransactionActive,
    #[error("missing column {0}")]
    MissingColumn(String),
    #[error("column {column} is not of type {expected}")]
    ColumnType {
        column: String,
        expected: &'static str,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Transactional row store consumed by the engine.
///
/// Every mutating call must happen between `begin` and `commit`/`rollback`.
/// The engine guarantees a single open transaction per store at a time, so
/// implementations need no per-row locking.
#[async_trait]
pub trait RowStore: std::fmt::Debug + Send + Sync + 'static {
    async fn begin(&self) -> StoreResult<()>;

    async fn commit(&self) -> StoreResult<()>;

    async fn rollback(&self) -> StoreResult<()>;

    /// Inserts a row and returns its freshly assigned id.
    async fn insert(&self, table: &str, fields: Fields) -> StoreResult<RowId>;

    /// Overwrites the given columns of an existing row; other columns keep
    /// their values.
    async fn update(&self, table: &str, id: RowId, fields: Fields) -> StoreResult<()>;

    /// Deletes all rows matching `filter`, returning how many were removed.
    async fn delete(&self, table: &str, filter: &Filter) -> StoreResult<u64>;

    async fn query(&self, table: &str, query: &Query) -> StoreResult<Vec<Record>>;

    async fn get(&self, table: &str, id: RowId) -> StoreResult<Option<Record>> {
        let mut rows = self.query(table, &Query::new(Filter::Id(id))).await?;
        Ok(rows.pop())
    }
}
