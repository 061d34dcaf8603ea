//! Materialized query results.

use sqlmapper_core::{ObjectHandle, Value};

/// One materialized row: either a plain value (single-column shapes) or a
/// handle to an object in the session arena.
#[derive(Debug, Clone, PartialEq)]
pub enum RowValue {
    Value(Value),
    Object(ObjectHandle),
}

/// The ordered output of one query execution.
///
/// Entries are `None` for rows that produced no object (every mapped column
/// NULL and the empty-row setting off). Lists are frozen into `Arc` before
/// being returned or cached, so a cache hit yields the identical list.
#[derive(Debug, Default, PartialEq)]
pub struct ResultList {
    rows: Vec<Option<RowValue>>,
}

impl ResultList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, row: Option<RowValue>) {
        self.rows.push(row);
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&RowValue> {
        self.rows.get(index).and_then(Option::as_ref)
    }

    pub fn rows(&self) -> impl Iterator<Item = Option<&RowValue>> {
        self.rows.iter().map(Option::as_ref)
    }

    /// Rows that materialized something.
    pub fn present(&self) -> impl Iterator<Item = &RowValue> {
        self.rows.iter().flatten()
    }

    /// The single row of a one-row result, if that is what this is.
    pub fn single(&self) -> Option<&RowValue> {
        if self.rows.len() == 1 {
            self.rows[0].as_ref()
        } else {
            None
        }
    }
}

impl FromIterator<Option<RowValue>> for ResultList {
    fn from_iter<T: IntoIterator<Item = Option<RowValue>>>(iter: T) -> Self {
        Self {
            rows: iter.into_iter().collect(),
        }
    }
}
