//! RedbRowStore - a durable row store backed by redb.
//!
//! Committed rows are read straight from the database on every call. Only
//! the open transaction's changes are held in memory; `commit` writes them
//! (plus the table id counters) in a single redb write transaction and
//! `rollback` simply drops them.

use anyhow::{Context, anyhow};
use nimbus_core::{Fields, Filter, Query, Record, RowId, RowStore, StoreError, StoreResult};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition, TableError};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

const NEXT_IDS: TableDefinition<&str, u64> = TableDefinition::new("__nimbus_next_ids");

fn row_table(name: &str) -> TableDefinition<'_, u64, &'static [u8]> {
    TableDefinition::new(name)
}

/// Final state of every row the open transaction touched; `None` marks a
/// deleted row.
type Overlay = BTreeMap<String, BTreeMap<RowId, Option<Fields>>>;

#[derive(Debug, Default)]
struct State {
    pending: Option<Overlay>,
    /// Next id per table, loaded on first insert. Not rewound on rollback,
    /// so ids handed out by an aborted transaction stay burnt.
    next_ids: BTreeMap<String, RowId>,
}

pub struct RedbRowStore {
    db: Arc<Database>,
    state: Mutex<State>,
}

fn decode_row(table: &str, id: RowId, bytes: &[u8]) -> anyhow::Result<Fields> {
    minicbor::decode(bytes).map_err(|e| anyhow!("corrupt row {id} in {table}: {e}"))
}

/// Committed rows of `table` matching `filter`, in id order.
fn scan(db: &Database, table: &str, filter: &Filter) -> anyhow::Result<Vec<Record>> {
    let read_txn = db.begin_read()?;
    let rows = match read_txn.open_table(row_table(table)) {
        Ok(rows) => rows,
        Err(TableError::TableDoesNotExist(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    if let Filter::Id(id) = filter {
        return match rows.get(*id)? {
            Some(bytes) => Ok(vec![Record::new(*id, decode_row(table, *id, bytes.value())?)]),
            None => Ok(Vec::new()),
        };
    }
    let mut out = Vec::new();
    for entry in rows.iter()? {
        let (id, bytes) = entry?;
        let fields = decode_row(table, id.value(), bytes.value())?;
        if filter.matches(id.value(), &fields) {
            out.push(Record::new(id.value(), fields));
        }
    }
    Ok(out)
}

/// First id never handed out for `table`: the stored counter, or one past
/// the highest stored row if that is larger.
fn stored_next_id(db: &Database, table: &str) -> anyhow::Result<RowId> {
    let read_txn = db.begin_read()?;
    let counters = read_txn.open_table(NEXT_IDS)?;
    let counted = counters.get(table)?.map_or(1, |next| next.value());
    let after_last = match read_txn.open_table(row_table(table)) {
        Ok(rows) => rows.last()?.map_or(1, |(id, _)| id.value() + 1),
        Err(TableError::TableDoesNotExist(_)) => 1,
        Err(e) => return Err(e.into()),
    };
    Ok(counted.max(after_last))
}

impl RedbRowStore {
    /// Opens (or creates) `pool.redb` under `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        std::fs::create_dir_all(path)
            .with_context(|| format!("creating pool directory {}", path.display()))?;
        let db = Database::create(path.join("pool.redb"))?;

        // A fresh database has no tables yet; make sure the id counter table
        // exists so read transactions can always open it.
        {
            let write_txn = db.begin_write()?;
            {
                let _ = write_txn.open_table(NEXT_IDS)?;
            }
            write_txn.commit()?;
        }
        tracing::debug!("redb store opened at {}", path.display());

        Ok(Self {
            db: Arc::new(db),
            state: Mutex::new(State::default()),
        })
    }

    fn lock(&self) -> StoreResult<MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| StoreError::Other(anyhow!("redb store lock poisoned")))
    }

    fn require_transaction(&self) -> StoreResult<()> {
        match self.lock()?.pending {
            Some(_) => Ok(()),
            None => Err(StoreError::NoTransaction),
        }
    }

    /// Runs `f` against the database on the blocking pool.
    async fn blocking<T, F>(&self, what: &'static str, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| anyhow!("redb {what} task failed: {e}"))?
            .map_err(StoreError::Other)
    }

    /// The row as the open transaction sees it.
    async fn current_row(&self, table: &str, id: RowId) -> StoreResult<Option<Fields>> {
        {
            let state = self.lock()?;
            if let Some(row) = state
                .pending
                .as_ref()
                .and_then(|pending| pending.get(table))
                .and_then(|rows| rows.get(&id))
            {
                return Ok(row.clone());
            }
        }
        let name = table.to_owned();
        let mut rows = self
            .blocking("read", move |db| scan(db, &name, &Filter::Id(id)))
            .await?;
        Ok(rows.pop().map(|record| record.fields))
    }

    fn stage(&self, table: &str, id: RowId, row: Option<Fields>) -> StoreResult<()> {
        let mut state = self.lock()?;
        let pending = state.pending.as_mut().ok_or(StoreError::NoTransaction)?;
        pending.entry(table.to_owned()).or_default().insert(id, row);
        Ok(())
    }
}

impl std::fmt::Debug for RedbRowStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbRowStore").finish()
    }
}

#[async_trait::async_trait]
impl RowStore for RedbRowStore {
    async fn begin(&self) -> StoreResult<()> {
        let mut state = self.lock()?;
        if state.pending.is_some() {
            return Err(StoreError::TransactionActive);
        }
        state.pending = Some(Overlay::new());
        Ok(())
    }

    async fn commit(&self) -> StoreResult<()> {
        let (pending, counters) = {
            let mut state = self.lock()?;
            let pending = state.pending.take().ok_or(StoreError::NoTransaction)?;
            let counters: Vec<(String, RowId)> = pending
                .keys()
                .filter_map(|table| state.next_ids.get(table).map(|n| (table.clone(), *n)))
                .collect();
            (pending, counters)
        };

        self.blocking("commit", move |db| {
            let write_txn = db.begin_write()?;
            for (table, rows) in &pending {
                let mut t = write_txn.open_table(row_table(table))?;
                for (id, row) in rows {
                    match row {
                        Some(fields) => {
                            let bytes = minicbor::to_vec(fields)
                                .map_err(|e| anyhow!("encoding row {id} of {table}: {e}"))?;
                            t.insert(*id, bytes.as_slice())?;
                        }
                        None => {
                            t.remove(*id)?;
                        }
                    }
                }
            }
            {
                let mut t = write_txn.open_table(NEXT_IDS)?;
                for (table, next) in &counters {
                    t.insert(table.as_str(), *next)?;
                }
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
        .inspect_err(|err| tracing::warn!("redb commit failed, changes dropped: {err}"))
    }

    async fn rollback(&self) -> StoreResult<()> {
        self.lock()?
            .pending
            .take()
            .map(|_| ())
            .ok_or(StoreError::NoTransaction)
    }

    async fn insert(&self, table: &str, fields: Fields) -> StoreResult<RowId> {
        self.require_transaction()?;
        let cached = self.lock()?.next_ids.get(table).copied();
        let next = match cached {
            Some(next) => next,
            None => {
                let name = table.to_owned();
                self.blocking("read", move |db| stored_next_id(db, &name))
                    .await?
            }
        };
        let id = {
            let mut state = self.lock()?;
            let counter = state.next_ids.entry(table.to_owned()).or_insert(next);
            let id = *counter;
            *counter += 1;
            id
        };
        self.stage(table, id, Some(fields))?;
        Ok(id)
    }

    async fn update(&self, table: &str, id: RowId, fields: Fields) -> StoreResult<()> {
        self.require_transaction()?;
        let mut row = self
            .current_row(table, id)
            .await?
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_owned(),
                id,
            })?;
        row.extend(fields);
        self.stage(table, id, Some(row))
    }

    async fn delete(&self, table: &str, filter: &Filter) -> StoreResult<u64> {
        self.require_transaction()?;
        let doomed = self.query(table, &Query::new(filter.clone())).await?;
        for record in &doomed {
            self.stage(table, record.id, None)?;
        }
        Ok(doomed.len() as u64)
    }

    async fn query(&self, table: &str, query: &Query) -> StoreResult<Vec<Record>> {
        let name = table.to_owned();
        let filter = query.filter.clone();
        let mut records = self
            .blocking("read", move |db| scan(db, &name, &filter))
            .await?;

        let state = self.lock()?;
        if let Some(staged) = state
            .pending
            .as_ref()
            .and_then(|pending| pending.get(table))
        {
            records.retain(|record| !staged.contains_key(&record.id));
            for (id, row) in staged {
                if let Some(fields) = row
                    && query.filter.matches(*id, fields)
                {
                    records.push(Record::new(*id, fields.clone()));
                }
            }
            records.sort_by_key(|record| record.id);
        }
        Ok(query.finish(records))
    }

    async fn get(&self, table: &str, id: RowId) -> StoreResult<Option<Record>> {
        Ok(self
            .current_row(table, id)
            .await?
            .map(|fields| Record::new(id, fields)))
    }
}
