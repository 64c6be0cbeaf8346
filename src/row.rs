//! Result rows and row decoding.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::value::FromValue;

/// Column metadata shared by every row of a result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    /// Column name (or alias)
    pub name: String,
    /// Protocol-specific type identifier (PostgreSQL OID, MySQL field type, DB2 SQL type)
    pub type_id: u32,
}

impl ColumnInfo {
    pub fn new(name: impl Into<String>, type_id: u32) -> Self {
        Self {
            name: name.into(),
            type_id,
        }
    }
}

/// Shared column list.
pub type Columns = Arc<[ColumnInfo]>;

/// One result row. Values are in text format; `None` is SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    columns: Columns,
    values: Vec<Option<Vec<u8>>>,
}

impl Row {
    pub(crate) fn new(columns: Columns, values: Vec<Option<Vec<u8>>>) -> Self {
        Self { columns, values }
    }

    pub fn columns(&self) -> &[ColumnInfo] {
        &self.columns
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw column value by index.
    pub fn raw(&self, idx: usize) -> Option<&[u8]> {
        self.values.get(idx).and_then(|v| v.as_deref())
    }

    /// Decode the column at `idx`.
    pub fn get<'a, T: FromValue<'a>>(&'a self, idx: usize) -> Result<T> {
        let value = self
            .values
            .get(idx)
            .ok_or_else(|| Error::Decode(format!("column index {} out of range", idx)))?;
        match value {
            None => T::from_null(),
            Some(bytes) => T::from_text(bytes),
        }
    }

    /// Decode the column named `name`.
    pub fn get_by_name<'a, T: FromValue<'a>>(&'a self, name: &str) -> Result<T> {
        let idx = self
            .columns
            .iter()
            .position(|c| c.name == name)
            .ok_or_else(|| Error::Decode(format!("no column named {}", name)))?;
        self.get(idx)
    }
}

/// Result of one statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    /// Column descriptions (empty for statements without a result set)
    pub columns: Vec<ColumnInfo>,
    /// Rows in server order
    pub rows: Vec<Row>,
    /// Rows affected, when the server reports it
    pub rows_affected: Option<u64>,
    /// Generated id (MySQL `LAST_INSERT_ID`)
    pub last_insert_id: Option<u64>,
    /// Result of the next statement in a multi-statement simple query
    pub next: Option<Box<QueryResult>>,
}

impl QueryResult {
    /// Append a result to the end of the `next` chain.
    pub(crate) fn push_next(&mut self, result: QueryResult) {
        match &mut self.next {
            Some(next) => next.push_next(result),
            None => self.next = Some(Box::new(result)),
        }
    }

    /// Iterate over this result and every chained result.
    pub fn iter(&self) -> impl Iterator<Item = &QueryResult> {
        std::iter::successors(Some(self), |r| r.next.as_deref())
    }
}

/// Trait for decoding a row into a Rust type.
pub trait FromRow<'a>: Sized {
    fn from_row(row: &'a Row) -> Result<Self>;
}

macro_rules! impl_from_row_tuple {
    ($len:expr => $($name:ident : $idx:tt),+) => {
        impl<'a, $($name: FromValue<'a>),+> FromRow<'a> for ($($name,)+) {
            fn from_row(row: &'a Row) -> Result<Self> {
                if row.len() < $len {
                    return Err(Error::Decode("not enough columns for tuple".into()));
                }
                Ok(($(row.get::<$name>($idx)?,)+))
            }
        }
    };
}

impl_from_row_tuple!(1 => T1: 0);
impl_from_row_tuple!(2 => T1: 0, T2: 1);
impl_from_row_tuple!(3 => T1: 0, T2: 1, T3: 2);
impl_from_row_tuple!(4 => T1: 0, T2: 1, T3: 2, T4: 3);
impl_from_row_tuple!(5 => T1: 0, T2: 1, T3: 2, T4: 3, T5: 4);
impl_from_row_tuple!(6 => T1: 0, T2: 1, T3: 2, T4: 3, T5: 4, T6: 5);
