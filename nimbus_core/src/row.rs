//! Row values and the small query language stores must understand.

use minicbor::{Decode, Encode};
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::store::{StoreError, StoreResult};

/// Row identifier. Monotonically increasing per table, never reused.
pub type RowId = u64;

/// Column name to value mapping for one row.
pub type Fields = BTreeMap<String, Value>;

/// A single column value.
#[derive(Encode, Decode, Clone, Debug, PartialEq, Eq)]
pub enum Value {
    #[n(0)]
    Null,
    #[n(1)]
    Int(#[n(0)] i64),
    #[n(2)]
    Text(#[n(0)] String),
    #[n(3)]
    Bytes(
        #[n(0)]
        #[cbor(with = "minicbor::bytes")]
        Vec<u8>,
    ),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Int(_) => 1,
            Value::Text(_) => 2,
            Value::Bytes(_) => 3,
        }
    }

    /// Total order used for `ORDER BY` and range filters. Values of
    /// different types order by type first; `Null` sorts lowest.
    pub fn compare(&self, other: &Value) -> Ordering {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a.cmp(b),
            (Value::Text(a), Value::Text(b)) => a.cmp(b),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        // Row ids and sizes stay well below i64::MAX.
        Value::Int(v as i64)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(i64::from(v))
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// A stored row: its id plus column values.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub id: RowId,
    pub fields: Fields,
}

impl Record {
    pub fn new(id: RowId, fields: Fields) -> Self {
        Self { id, fields }
    }

    fn column(&self, column: &str) -> StoreResult<&Value> {
        self.fields
            .get(column)
            .ok_or_else(|| StoreError::MissingColumn(column.to_owned()))
    }

    fn type_error(&self, column: &str, expected: &'static str) -> StoreError {
        StoreError::ColumnType {
            column: column.to_owned(),
            expected,
        }
    }

    /// Reads a non-null integer column.
    pub fn int(&self, column: &str) -> StoreResult<i64> {
        match self.column(column)? {
            Value::Int(v) => Ok(*v),
            _ => Err(self.type_error(column, "int")),
        }
    }

    /// Reads a non-null integer column as `u64`.
    pub fn uint(&self, column: &str) -> StoreResult<u64> {
        let v = self.int(column)?;
        u64::try_from(v).map_err(|_| self.type_error(column, "unsigned int"))
    }

    /// Reads a nullable integer column. A missing column reads as null.
    pub fn opt_uint(&self, column: &str) -> StoreResult<Option<u64>> {
        match self.fields.get(column) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Int(v)) => u64::try_from(*v)
                .map(Some)
                .map_err(|_| self.type_error(column, "unsigned int")),
            Some(_) => Err(self.type_error(column, "int")),
        }
    }

    pub fn opt_int(&self, column: &str) -> StoreResult<Option<i64>> {
        match self.fields.get(column) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Int(v)) => Ok(Some(*v)),
            Some(_) => Err(self.type_error(column, "int")),
        }
    }

    pub fn text(&self, column: &str) -> StoreResult<&str> {
        match self.column(column)? {
            Value::Text(v) => Ok(v),
            _ => Err(self.type_error(column, "text")),
        }
    }

    pub fn bytes(&self, column: &str) -> StoreResult<&[u8]> {
        match self.column(column)? {
            Value::Bytes(v) => Ok(v),
            _ => Err(self.type_error(column, "bytes")),
        }
    }

    pub fn opt_bytes(&self, column: &str) -> StoreResult<Option<&[u8]>> {
        match self.fields.get(column) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bytes(v)) => Ok(Some(v)),
            Some(_) => Err(self.type_error(column, "bytes")),
        }
    }
}

/// Row predicate for `query` and `delete`.
#[derive(Clone, Debug, PartialEq)]
pub enum Filter {
    All,
    Id(RowId),
    Eq(String, Value),
    Ge(String, Value),
    IsNull(String),
    NotNull(String),
    And(Vec<Filter>),
}

impl Filter {
    pub fn eq(column: &str, value: impl Into<Value>) -> Self {
        Filter::Eq(column.to_owned(), value.into())
    }

    pub fn ge(column: &str, value: impl Into<Value>) -> Self {
        Filter::Ge(column.to_owned(), value.into())
    }

    pub fn is_null(column: &str) -> Self {
        Filter::IsNull(column.to_owned())
    }

    pub fn not_null(column: &str) -> Self {
        Filter::NotNull(column.to_owned())
    }

    /// Conjunction; flattens nested `And`s.
    pub fn and(self, other: Filter) -> Self {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (Filter::And(mut a), Filter::And(b)) => {
                a.extend(b);
                Filter::And(a)
            }
            (Filter::And(mut a), f) => {
                a.push(f);
                Filter::And(a)
            }
            (f, Filter::And(mut b)) => {
                b.insert(0, f);
                Filter::And(b)
            }
            (a, b) => Filter::And(vec![a, b]),
        }
    }

    pub fn matches(&self, id: RowId, fields: &Fields) -> bool {
        let get = |c: &str| fields.get(c).unwrap_or(&Value::Null);
        match self {
            Filter::All => true,
            Filter::Id(want) => *want == id,
            Filter::Eq(c, v) => get(c) == v,
            Filter::Ge(c, v) => {
                let have = get(c);
                !have.is_null() && have.compare(v) != Ordering::Less
            }
            Filter::IsNull(c) => get(c).is_null(),
            Filter::NotNull(c) => !get(c).is_null(),
            Filter::And(all) => all.iter().all(|f| f.matches(id, fields)),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub descending: bool,
}

/// A `query` request. Results are ordered by row id unless `order_by` is set.
#[derive(Clone, Debug, PartialEq)]
pub struct Query {
    pub filter: Filter,
    pub order_by: Option<OrderBy>,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl Query {
    pub fn new(filter: Filter) -> Self {
        Self {
            filter,
            order_by: None,
            limit: None,
            offset: 0,
        }
    }

    pub fn all() -> Self {
        Self::new(Filter::All)
    }

    pub fn order_by(mut self, column: &str) -> Self {
        self.order_by = Some(OrderBy {
            column: column.to_owned(),
            descending: false,
        });
        self
    }

    pub fn order_by_desc(mut self, column: &str) -> Self {
        self.order_by = Some(OrderBy {
            column: column.to_owned(),
            descending: true,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// Applies ordering, offset and limit to already-filtered records.
    /// Ties on the order column fall back to row id so results are stable.
    pub fn finish(&self, mut records: Vec<Record>) -> Vec<Record> {
        if let Some(order) = &self.order_by {
            records.sort_by(|a, b| {
                let va = a.fields.get(&order.column).unwrap_or(&Value::Null);
                let vb = b.fields.get(&order.column).unwrap_or(&Value::Null);
                let ord = va.compare(vb).then(a.id.cmp(&b.id));
                if order.descending { ord.reverse() } else { ord }
            });
        }
        let iter = records.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => iter.take(limit).collect(),
            None => iter.collect(),
        }
    }
}

/// Builds a [`Fields`] map from `column => value` pairs.
#[macro_export]
macro_rules! fields {
    ($($col:expr => $val:expr),* $(,)?) => {{
        #[allow(unused_mut)]
        let mut f = $crate::row::Fields::new();
        $( f.insert(String::from($col), $crate::row::Value::from($val)); )*
        f
    }};
}
