//! The physical-execution seam.
//!
//! A [`Backend`] turns bound SQL into a row cursor or an affected-row
//! count. The engine never talks to a driver directly; everything physical
//! goes through these two traits.

use sqlmapper_core::{
    BoundSql, ColumnMeta, Error, ParamBag, Result, Row, StatementDescriptor,
};

/// A forward-only cursor over one physical result set.
pub trait RowCursor: Send {
    /// Column metadata, fixed for the life of the cursor.
    fn columns(&self) -> &[ColumnMeta];

    /// Fetch the next row, or `None` when the cursor is exhausted.
    fn advance(&mut self) -> Result<Option<Row>>;

    /// Can this cursor seek directly to a row index?
    fn supports_absolute(&self) -> bool {
        false
    }

    /// Position the cursor so the next `advance` yields row `index`.
    /// The default implementation skips forward row by row.
    fn absolute(&mut self, index: usize) -> Result<()> {
        for _ in 0..index {
            if self.advance()?.is_none() {
                break;
            }
        }
        Ok(())
    }
}

/// Everything a query execution hands back.
pub struct QueryOutput {
    pub cursor: Box<dyn RowCursor>,
    /// Output-parameter values produced by a procedure call.
    pub out_params: Option<ParamBag>,
}

impl QueryOutput {
    pub fn rows(cursor: Box<dyn RowCursor>) -> Self {
        Self {
            cursor,
            out_params: None,
        }
    }
}

/// Physical execution against the backing store.
pub trait Backend: Send {
    fn execute_query(
        &mut self,
        statement: &StatementDescriptor,
        bound: &BoundSql,
        bag: &ParamBag,
    ) -> Result<QueryOutput>;

    fn execute_update(
        &mut self,
        statement: &StatementDescriptor,
        bound: &BoundSql,
        bag: &ParamBag,
    ) -> Result<u64>;

    /// Flush any buffered statements. `rolling_back` signals that buffered
    /// work should be discarded instead of sent.
    fn flush(&mut self, rolling_back: bool) -> Result<()> {
        let _ = rolling_back;
        Ok(())
    }

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }
}

/// An in-memory cursor over pre-built rows. Useful for backends that buffer
/// and for tests.
pub struct VecCursor {
    columns: Vec<ColumnMeta>,
    rows: std::vec::IntoIter<Row>,
}

impl VecCursor {
    pub fn new(columns: Vec<ColumnMeta>, rows: Vec<Row>) -> Self {
        Self {
            columns,
            rows: rows.into_iter(),
        }
    }
}

impl RowCursor for VecCursor {
    fn columns(&self) -> &[ColumnMeta] {
        &self.columns
    }

    fn advance(&mut self) -> Result<Option<Row>> {
        Ok(self.rows.next())
    }

    fn supports_absolute(&self) -> bool {
        true
    }

    fn absolute(&mut self, index: usize) -> Result<()> {
        for _ in 0..index {
            if self.rows.next().is_none() {
                break;
            }
        }
        Ok(())
    }
}

/// Map a backend failure into an execution error tagged with the statement.
pub fn execution_failure(statement: &str, message: impl Into<String>) -> Error {
    Error::execution_in(statement, message)
}
