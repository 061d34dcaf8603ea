//! Pull-based streaming over query results.
//!
//! A [`QueryCursor`] materializes on demand instead of draining the whole
//! result set up front. Simple shapes stream one object per row. Nested
//! shapes require rows grouped by parent key (`result_ordered`); each
//! completed group emits one object and the grouping scratch is cleared so
//! memory stays proportional to one group.

use crate::backend::{Backend, RowCursor};
use crate::cursor::ColumnAnalysis;
use crate::materializer::MaterializeState;
use crate::result::{ResultList, RowValue};
use crate::session::Session;
use sqlmapper_core::{
    Error, LocalCacheScope, ParamBag, Result, ResultShape, RowBounds, StatementDescriptor,
    StatementKind,
};
use std::sync::Arc;

enum Mode {
    Simple,
    Ordered { previous: Option<RowValue> },
    /// Fallback for nested shapes without ordered rows: the whole result is
    /// materialized up front and replayed.
    Buffered {
        list: Arc<ResultList>,
        index: usize,
    },
}

/// A lazily materializing cursor bound to its session.
pub struct QueryCursor<'s, B: Backend> {
    session: &'s mut Session<B>,
    statement: Arc<StatementDescriptor>,
    shape: Arc<ResultShape>,
    cursor: Option<Box<dyn RowCursor>>,
    bag: ParamBag,
    state: MaterializeState,
    mode: Mode,
    remaining: usize,
    done: bool,
}

impl<B: Backend> std::fmt::Debug for QueryCursor<'_, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCursor").finish_non_exhaustive()
    }
}

impl<B: Backend> Session<B> {
    /// Open a streaming cursor over a query statement.
    ///
    /// Streamed rows bypass the session cache: nothing is stored and hits
    /// are not consulted. The one exception is the unordered-nested
    /// fallback, which buffers through the regular query path and so reads
    /// and populates the cache like any other query.
    pub fn query_cursor(
        &mut self,
        statement_id: &str,
        bag: &ParamBag,
        bounds: RowBounds,
    ) -> Result<QueryCursor<'_, B>> {
        self.ensure_open()?;
        let statement = self.config.statement(statement_id)?;
        if !matches!(statement.kind, StatementKind::Query) {
            return Err(Error::config(format!(
                "statement '{statement_id}' is not a query"
            )));
        }
        let Some(shape_id) = &statement.shape else {
            return Err(Error::config(format!(
                "statement '{statement_id}' has no result shape to stream"
            )));
        };
        let shape = self.config.shape(shape_id)?;

        if shape.has_nested_shapes() && !statement.result_ordered {
            if self.config.settings.safe_cursor {
                return Err(Error::config(format!(
                    "statement '{statement_id}' has nested result shapes but is not \
                     result-ordered; streaming would be unsound"
                )));
            }
            // Unordered nested rows cannot stream; buffer and replay.
            let list = self.query_bounded(statement_id, bag, bounds)?;
            let state = MaterializeState::new(ColumnAnalysis::new(Vec::new()));
            return Ok(QueryCursor {
                session: self,
                statement,
                shape,
                cursor: None,
                bag: bag.clone(),
                state,
                mode: Mode::Buffered { list, index: 0 },
                remaining: usize::MAX,
                done: false,
            });
        }

        let bound = statement.bound_sql(bag);
        let output = self.backend.execute_query(&statement, &bound, bag)?;
        let mut cursor = output.cursor;
        if bounds.offset > 0 {
            if cursor.supports_absolute() {
                cursor.absolute(bounds.offset)?;
            } else {
                for _ in 0..bounds.offset {
                    if cursor.advance()?.is_none() {
                        break;
                    }
                }
            }
        }
        let state = MaterializeState::new(ColumnAnalysis::new(cursor.columns().to_vec()));
        let mode = if shape.has_nested_shapes() {
            Mode::Ordered { previous: None }
        } else {
            Mode::Simple
        };
        Ok(QueryCursor {
            session: self,
            statement,
            shape,
            cursor: Some(cursor),
            bag: bag.clone(),
            state,
            mode,
            remaining: bounds.limit,
            done: false,
        })
    }
}

impl<B: Backend> QueryCursor<'_, B> {
    /// Materialize the next object. `Ok(None)` marks exhaustion.
    pub fn next(&mut self) -> Result<Option<RowValue>> {
        if self.done {
            return Ok(None);
        }
        let result = self.advance_inner();
        match &result {
            Ok(None) | Err(_) => self.finish(),
            Ok(Some(_)) => {}
        }
        result
    }

    fn advance_inner(&mut self) -> Result<Option<RowValue>> {
        match self.mode {
            Mode::Buffered { .. } => Ok(self.advance_buffered()),
            Mode::Simple => self.advance_simple(),
            Mode::Ordered { .. } => self.advance_ordered(),
        }
    }

    fn advance_buffered(&mut self) -> Option<RowValue> {
        let Mode::Buffered { list, index } = &mut self.mode else {
            return None;
        };
        while *index < list.len() {
            let value = list.get(*index).cloned();
            *index += 1;
            if value.is_some() {
                return value;
            }
        }
        None
    }

    fn advance_simple(&mut self) -> Result<Option<RowValue>> {
        loop {
            if self.remaining == 0 {
                return Ok(None);
            }
            let row = match self.cursor.as_mut() {
                Some(cursor) => cursor.advance()?,
                None => None,
            };
            let Some(row) = row else {
                return Ok(None);
            };
            self.remaining -= 1;
            let resolved = self.session.resolve_discriminated(
                &row,
                Arc::clone(&self.shape),
                "",
                &mut self.state,
            )?;
            if let Some(value) =
                self.session
                    .row_value_simple(&row, &resolved, "", &self.bag, &mut self.state)?
            {
                return Ok(Some(value));
            }
        }
    }

    fn advance_ordered(&mut self) -> Result<Option<RowValue>> {
        loop {
            if self.remaining == 0 {
                return Ok(None);
            }
            let row = match self.cursor.as_mut() {
                Some(cursor) => cursor.advance()?,
                None => None,
            };
            let Some(row) = row else {
                // Trailing group.
                if let Mode::Ordered { previous } = &mut self.mode {
                    if let Some(value) = previous.take() {
                        self.remaining -= 1;
                        return Ok(Some(value));
                    }
                }
                return Ok(None);
            };
            let resolved = self.session.resolve_discriminated(
                &row,
                Arc::clone(&self.shape),
                "",
                &mut self.state,
            )?;
            let row_key = self
                .session
                .create_row_key(&row, &resolved, "", &mut self.state)?;
            let partial = row_key
                .as_ref()
                .and_then(|k| self.state.partial_for(k))
                .flatten();

            let group_complete = partial.is_none();
            let mut emit = None;
            if group_complete {
                if let Mode::Ordered { previous } = &mut self.mode {
                    emit = previous.take();
                }
                if emit.is_some() {
                    self.state.clear_groups();
                }
            }
            let value = self.session.row_value_nested(
                &row,
                &resolved,
                row_key,
                "",
                partial,
                &self.bag,
                &mut self.state,
            )?;
            if let Mode::Ordered { previous } = &mut self.mode {
                *previous = value;
            }
            if let Some(value) = emit {
                self.remaining -= 1;
                return Ok(Some(value));
            }
        }
    }

    fn finish(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        self.cursor = None;
        self.session.flush_deferred();
        if self.session.config().settings.local_cache_scope == LocalCacheScope::Statement {
            self.session.clear_local_cache();
        }
    }

    pub fn statement_id(&self) -> &str {
        &self.statement.id
    }
}
