//! In-memory tables with an undo journal.
//!
//! The memory store keeps its whole state in a [`TableSet`]; rollback
//! replays the journal backwards.

use std::collections::BTreeMap;

use crate::row::{Fields, Filter, Query, Record, RowId};
use crate::store::{StoreError, StoreResult};

/// One journaled mutation. `previous` holds the row as it was before.
#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    Inserted { table: String, id: RowId },
    Updated { table: String, id: RowId, previous: Fields },
    Deleted { table: String, id: RowId, previous: Fields },
}

#[derive(Debug, Default)]
pub struct TableSet {
    tables: BTreeMap<String, BTreeMap<RowId, Fields>>,
    next_ids: BTreeMap<String, RowId>,
    journal: Option<Vec<Change>>,
}

impl TableSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self) -> StoreResult<()> {
        if self.journal.is_some() {
            return Err(StoreError::TransactionActive);
        }
        self.journal = Some(Vec::new());
        Ok(())
    }

    /// Ends the transaction, handing back its journal in application order.
    pub fn commit(&mut self) -> StoreResult<Vec<Change>> {
        self.journal.take().ok_or(StoreError::NoTransaction)
    }

    /// Undoes every journaled change, newest first. Id counters are not
    /// rewound, so ids handed out inside the aborted transaction stay burnt.
    pub fn rollback(&mut self) -> StoreResult<()> {
        let journal = self.journal.take().ok_or(StoreError::NoTransaction)?;
        for change in journal.into_iter().rev() {
            match change {
                Change::Inserted { table, id } => {
                    if let Some(rows) = self.tables.get_mut(&table) {
                        rows.remove(&id);
                    }
                }
                Change::Updated {
                    table,
                    id,
                    previous,
                }
                | Change::Deleted {
                    table,
                    id,
                    previous,
                } => {
                    self.tables.entry(table).or_default().insert(id, previous);
                }
            }
        }
        Ok(())
    }

    fn journal_mut(&mut self) -> StoreResult<&mut Vec<Change>> {
        self.journal.as_mut().ok_or(StoreError::NoTransaction)
    }

    pub fn insert(&mut self, table: &str, fields: Fields) -> StoreResult<RowId> {
        self.journal_mut()?;
        let next = self.next_ids.entry(table.to_owned()).or_insert(1);
        let id = *next;
        *next += 1;
        self.tables
            .entry(table.to_owned())
            .or_default()
            .insert(id, fields);
        self.journal_mut()?.push(Change::Inserted {
            table: table.to_owned(),
            id,
        });
        Ok(id)
    }

    pub fn update(&mut self, table: &str, id: RowId, fields: Fields) -> StoreResult<()> {
        self.journal_mut()?;
        let row = self
            .tables
            .get_mut(table)
            .and_then(|rows| rows.get_mut(&id))
            .ok_or_else(|| StoreError::NotFound {
                table: table.to_owned(),
                id,
            })?;
        let previous = row.clone();
        row.extend(fields);
        self.journal_mut()?.push(Change::Updated {
            table: table.to_owned(),
            id,
            previous,
        });
        Ok(())
    }

    pub fn delete(&mut self, table: &str, filter: &Filter) -> StoreResult<u64> {
        self.journal_mut()?;
        let Some(rows) = self.tables.get_mut(table) else {
            return Ok(0);
        };
        let doomed: Vec<RowId> = rows
            .iter()
            .filter(|(id, fields)| filter.matches(**id, fields))
            .map(|(id, _)| *id)
            .collect();
        let mut removed = Vec::with_capacity(doomed.len());
        for id in doomed {
            if let Some(previous) = rows.remove(&id) {
                removed.push(Change::Deleted {
                    table: table.to_owned(),
                    id,
                    previous,
                });
            }
        }
        let count = removed.len() as u64;
        self.journal_mut()?.extend(removed);
        Ok(count)
    }

    pub fn query(&self, table: &str, query: &Query) -> Vec<Record> {
        let Some(rows) = self.tables.get(table) else {
            return Vec::new();
        };
        let matched = match &query.filter {
            Filter::Id(id) => rows
                .get(id)
                .map(|fields| vec![Record::new(*id, fields.clone())])
                .unwrap_or_default(),
            filter => rows
                .iter()
                .filter(|(id, fields)| filter.matches(**id, fields))
                .map(|(id, fields)| Record::new(*id, fields.clone()))
                .collect(),
        };
        query.finish(matched)
    }

    pub fn row(&self, table: &str, id: RowId) -> Option<&Fields> {
        self.tables.get(table).and_then(|rows| rows.get(&id))
    }
}
