//! Shared fixtures: a scriptable backend that records every physical
//! execution.
#![allow(dead_code)]

use sqlmapper_core::{
    BoundSql, ColumnMeta, Error, ParamBag, Result, Row, SourceType, StatementDescriptor, Value,
};
use sqlmapper_executor::{Backend, QueryOutput, VecCursor};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

type ResponseFn = Box<dyn Fn(&ParamBag) -> (Vec<ColumnMeta>, Vec<Row>) + Send>;

#[derive(Default)]
pub struct MockBackend {
    responses: HashMap<String, ResponseFn>,
    out_params: HashMap<String, ParamBag>,
    fail_once: Arc<Mutex<HashSet<String>>>,
    executed: Arc<Mutex<Vec<String>>>,
    updates: Arc<Mutex<Vec<String>>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Script a statement with a fixed result set.
    pub fn with_rows(
        mut self,
        statement_id: &str,
        columns: Vec<ColumnMeta>,
        rows: Vec<Vec<Value>>,
    ) -> Self {
        let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        self.responses.insert(
            statement_id.to_string(),
            Box::new(move |_bag| {
                let rows = rows
                    .iter()
                    .map(|values| Row::new(names.clone(), values.clone()))
                    .collect();
                (columns.clone(), rows)
            }),
        );
        self
    }

    /// Script a statement whose rows depend on the parameter bag.
    pub fn with_rows_fn(
        mut self,
        statement_id: &str,
        f: impl Fn(&ParamBag) -> (Vec<ColumnMeta>, Vec<Row>) + Send + 'static,
    ) -> Self {
        self.responses.insert(statement_id.to_string(), Box::new(f));
        self
    }

    pub fn with_out_params(mut self, statement_id: &str, out: ParamBag) -> Self {
        self.out_params.insert(statement_id.to_string(), out);
        self
    }

    /// Make the next execution of this statement fail.
    pub fn fail_next(&self, statement_id: &str) {
        self.fail_once
            .lock()
            .unwrap()
            .insert(statement_id.to_string());
    }

    /// Handle for asserting execution counts after the backend moves into a
    /// session.
    pub fn probe(&self) -> ExecutionProbe {
        ExecutionProbe {
            executed: Arc::clone(&self.executed),
            updates: Arc::clone(&self.updates),
            fail_once: Arc::clone(&self.fail_once),
        }
    }
}

#[derive(Clone)]
pub struct ExecutionProbe {
    executed: Arc<Mutex<Vec<String>>>,
    updates: Arc<Mutex<Vec<String>>>,
    fail_once: Arc<Mutex<HashSet<String>>>,
}

impl ExecutionProbe {
    pub fn query_count(&self, statement_id: &str) -> usize {
        self.executed
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == statement_id)
            .count()
    }

    pub fn total_queries(&self) -> usize {
        self.executed.lock().unwrap().len()
    }

    pub fn update_count(&self, statement_id: &str) -> usize {
        self.updates
            .lock()
            .unwrap()
            .iter()
            .filter(|id| id.as_str() == statement_id)
            .count()
    }

    pub fn fail_next(&self, statement_id: &str) {
        self.fail_once
            .lock()
            .unwrap()
            .insert(statement_id.to_string());
    }
}

impl Backend for MockBackend {
    fn execute_query(
        &mut self,
        statement: &StatementDescriptor,
        _bound: &BoundSql,
        bag: &ParamBag,
    ) -> Result<QueryOutput> {
        if self.fail_once.lock().unwrap().remove(&statement.id) {
            return Err(Error::execution_in(&statement.id, "injected failure"));
        }
        self.executed.lock().unwrap().push(statement.id.clone());
        let (columns, rows) = match self.responses.get(&statement.id) {
            Some(f) => f(bag),
            None => (Vec::new(), Vec::new()),
        };
        let mut output = QueryOutput::rows(Box::new(VecCursor::new(columns, rows)));
        output.out_params = self.out_params.get(&statement.id).cloned();
        Ok(output)
    }

    fn execute_update(
        &mut self,
        statement: &StatementDescriptor,
        _bound: &BoundSql,
        _bag: &ParamBag,
    ) -> Result<u64> {
        if self.fail_once.lock().unwrap().remove(&statement.id) {
            return Err(Error::execution_in(&statement.id, "injected failure"));
        }
        self.updates.lock().unwrap().push(statement.id.clone());
        Ok(1)
    }
}

pub fn col(name: &str, source: SourceType) -> ColumnMeta {
    ColumnMeta::new(name, source)
}

pub fn make_rows(columns: &[ColumnMeta], data: Vec<Vec<Value>>) -> Vec<Row> {
    let names: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
    data.into_iter()
        .map(|values| Row::new(names.clone(), values))
        .collect()
}
