//! The session: first-level caching, query lifecycle, deferred and lazy
//! loads, and transaction boundaries.

use crate::backend::Backend;
use crate::result::{ResultList, RowValue};
use sqlmapper_cache::{CacheKey, CacheLookup, SessionCache};
use sqlmapper_core::{
    BoundSql, Configuration, DefaultObjectFactory, Error, LoadId, LocalCacheScope, ObjectArena,
    ObjectFactory, ObjectHandle, ParamBag, Result, RowBounds, Slot, SlotItem, StatementDescriptor,
    StatementKind, Value,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

/// A nested load waiting for its key to resolve in the session cache.
#[derive(Debug)]
pub(crate) struct DeferredLoad {
    pub key: CacheKey,
    pub target: ObjectHandle,
    pub property: String,
    pub collection: bool,
}

/// A lazy load parked behind a `Slot::Pending` ticket.
#[derive(Debug)]
pub(crate) struct LazyLoad {
    pub statement_id: String,
    pub bag: ParamBag,
    pub collection: bool,
}

/// One unit of work against the backing store.
///
/// Owns the first-level cache, the object arena every materialized object
/// lives in, and the backend connection. Not `Sync`: a session is single
/// threaded by construction and callers needing concurrency open one
/// session per thread.
pub struct Session<B: Backend> {
    pub(crate) config: Arc<Configuration>,
    pub(crate) backend: B,
    pub(crate) factory: Arc<dyn ObjectFactory>,
    pub(crate) local_cache: SessionCache<Arc<ResultList>>,
    pub(crate) out_param_cache: SessionCache<ParamBag>,
    pub(crate) arena: ObjectArena,
    pub(crate) deferred: VecDeque<DeferredLoad>,
    pub(crate) lazy_loads: HashMap<LoadId, LazyLoad>,
    next_load_id: u64,
    pub(crate) query_stack: usize,
    closed: bool,
}

impl<B: Backend> Session<B> {
    pub fn new(config: Arc<Configuration>, backend: B) -> Self {
        Self::with_factory(config, backend, Arc::new(DefaultObjectFactory))
    }

    pub fn with_factory(
        config: Arc<Configuration>,
        backend: B,
        factory: Arc<dyn ObjectFactory>,
    ) -> Self {
        Self {
            config,
            backend,
            factory,
            local_cache: SessionCache::new(),
            out_param_cache: SessionCache::new(),
            arena: ObjectArena::new(),
            deferred: VecDeque::new(),
            lazy_loads: HashMap::new(),
            next_load_id: 0,
            query_stack: 0,
            closed: false,
        }
    }

    pub fn config(&self) -> &Arc<Configuration> {
        &self.config
    }

    pub fn arena(&self) -> &ObjectArena {
        &self.arena
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        if self.closed {
            Err(Error::execution("session is closed"))
        } else {
            Ok(())
        }
    }

    /// Run a query statement with default bounds.
    pub fn query(&mut self, statement_id: &str, bag: &ParamBag) -> Result<Arc<ResultList>> {
        self.query_bounded(statement_id, bag, RowBounds::DEFAULT)
    }

    /// Run a query statement, draining only the requested window.
    pub fn query_bounded(
        &mut self,
        statement_id: &str,
        bag: &ParamBag,
        bounds: RowBounds,
    ) -> Result<Arc<ResultList>> {
        let statement = self.config.statement(statement_id)?;
        if matches!(statement.kind, StatementKind::Update) {
            return Err(Error::config(format!(
                "statement '{statement_id}' is an update, not a query"
            )));
        }
        let (list, _) = self.run_query(&statement, bag, bounds)?;
        Ok(list)
    }

    /// Run a procedure-call statement, writing output parameters back onto
    /// the caller's bag. Cached output parameters are written back on hits
    /// exactly as fresh ones are on misses.
    pub fn call(&mut self, statement_id: &str, bag: &mut ParamBag) -> Result<Arc<ResultList>> {
        let statement = self.config.statement(statement_id)?;
        if !matches!(statement.kind, StatementKind::Call) {
            return Err(Error::config(format!(
                "statement '{statement_id}' is not a procedure call"
            )));
        }
        let (list, out_params) = self.run_query(&statement, &bag.clone(), RowBounds::DEFAULT)?;
        if let Some(out) = out_params {
            for (name, value) in out.iter() {
                bag.set(name, value.clone());
            }
        }
        Ok(list)
    }

    fn run_query(
        &mut self,
        statement: &Arc<StatementDescriptor>,
        bag: &ParamBag,
        bounds: RowBounds,
    ) -> Result<(Arc<ResultList>, Option<ParamBag>)> {
        self.ensure_open()?;
        if self.query_stack == 0 && statement.flush_cache {
            self.clear_local_cache();
        }
        let bound = statement.bound_sql(bag);
        let key = build_cache_key(&self.config, statement, bag, bounds, &bound);

        self.query_stack += 1;
        let outcome = self.query_with_key(statement, bag, bounds, &bound, &key);
        self.query_stack -= 1;
        let produced = outcome?;

        if self.query_stack == 0 {
            self.flush_deferred();
            if self.config.settings.local_cache_scope == LocalCacheScope::Statement {
                self.clear_local_cache();
            }
        }
        Ok(produced)
    }

    pub(crate) fn flush_deferred(&mut self) {
        while let Some(load) = self.deferred.pop_front() {
            self.run_deferred(&load);
        }
    }

    fn query_with_key(
        &mut self,
        statement: &Arc<StatementDescriptor>,
        bag: &ParamBag,
        bounds: RowBounds,
        bound: &BoundSql,
        key: &CacheKey,
    ) -> Result<(Arc<ResultList>, Option<ParamBag>)> {
        match self.local_cache.lookup(key) {
            CacheLookup::Hit(list) => {
                tracing::debug!(statement = %statement.id, "session cache hit");
                let list = Arc::clone(list);
                let out = self.out_param_cache.get(key).cloned();
                Ok((list, out))
            }
            // The same key is the query currently executing further up the
            // stack. Re-executing here would overwrite the placeholder and
            // recurse without bound; paths that can wait (nested result
            // properties) defer before reaching this point.
            CacheLookup::InFlight => Err(Error::execution_in(
                &statement.id,
                "statement is already executing under the same cache key",
            )),
            CacheLookup::Miss => self.query_from_database(statement, bag, bounds, bound, key),
        }
    }

    fn query_from_database(
        &mut self,
        statement: &Arc<StatementDescriptor>,
        bag: &ParamBag,
        bounds: RowBounds,
        bound: &BoundSql,
        key: &CacheKey,
    ) -> Result<(Arc<ResultList>, Option<ParamBag>)> {
        self.local_cache.put_placeholder(key.clone());
        let produced = self.execute_and_materialize(statement, bag, bounds, bound);
        // The placeholder never survives, success or failure.
        self.local_cache.remove(key);
        let (list, out_params) = produced?;

        let list = Arc::new(list);
        self.local_cache.put(key.clone(), Arc::clone(&list));
        if matches!(statement.kind, StatementKind::Call) {
            if let Some(out) = &out_params {
                self.out_param_cache.put(key.clone(), out.clone());
            }
        }
        tracing::debug!(statement = %statement.id, rows = list.len(), "query materialized");
        Ok((list, out_params))
    }

    fn execute_and_materialize(
        &mut self,
        statement: &Arc<StatementDescriptor>,
        bag: &ParamBag,
        bounds: RowBounds,
        bound: &BoundSql,
    ) -> Result<(ResultList, Option<ParamBag>)> {
        let output = self.backend.execute_query(statement, bound, bag)?;
        let list = self.materialize_cursor(statement, output.cursor, bounds, bag)?;
        Ok((list, output.out_params))
    }

    /// Run an update statement. Clears both local caches before executing.
    pub fn update(&mut self, statement_id: &str, bag: &ParamBag) -> Result<u64> {
        self.ensure_open()?;
        let statement = self.config.statement(statement_id)?;
        if !matches!(statement.kind, StatementKind::Update) {
            return Err(Error::config(format!(
                "statement '{statement_id}' is not an update"
            )));
        }
        self.clear_local_cache();
        let bound = statement.bound_sql(bag);
        self.backend.execute_update(&statement, &bound, bag)
    }

    /// Flush buffered statements without ending the transaction.
    pub fn flush_statements(&mut self) -> Result<()> {
        self.ensure_open()?;
        self.backend.flush(false)
    }

    pub fn commit(&mut self, required: bool) -> Result<()> {
        if self.closed {
            return Err(Error::execution("cannot commit, session is closed"));
        }
        self.clear_local_cache();
        self.backend.flush(false)?;
        if required {
            self.backend.commit()?;
        }
        Ok(())
    }

    pub fn rollback(&mut self, required: bool) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.clear_local_cache();
        self.backend.flush(true)?;
        if required {
            self.backend.rollback()?;
        }
        Ok(())
    }

    /// Close the session, rolling back first. Safe to call twice.
    pub fn close(&mut self, force_rollback: bool) {
        if self.closed {
            return;
        }
        if let Err(error) = self.rollback(force_rollback) {
            tracing::warn!(%error, "rollback during close failed");
        }
        self.closed = true;
        self.local_cache.clear();
        self.out_param_cache.clear();
        self.deferred.clear();
        self.lazy_loads.clear();
    }

    pub fn clear_local_cache(&mut self) {
        if !self.closed {
            self.local_cache.clear();
            self.out_param_cache.clear();
        }
    }

    /// Build the cache key a statement execution would be stored under.
    pub fn create_cache_key(
        &self,
        statement_id: &str,
        bag: &ParamBag,
        bounds: RowBounds,
    ) -> Result<CacheKey> {
        self.ensure_open()?;
        let statement = self.config.statement(statement_id)?;
        let bound = statement.bound_sql(bag);
        Ok(build_cache_key(&self.config, &statement, bag, bounds, &bound))
    }

    // ---- deferred loads ----

    /// Register a load of `key` into `target.property`. Runs immediately
    /// when the key is already resolved; otherwise queues until the query
    /// stack unwinds.
    pub(crate) fn defer_load(
        &mut self,
        key: CacheKey,
        target: ObjectHandle,
        property: String,
        collection: bool,
    ) {
        let load = DeferredLoad {
            key,
            target,
            property,
            collection,
        };
        if self.local_cache.has_resolved(&load.key) {
            self.run_deferred(&load);
        } else {
            self.deferred.push_back(load);
        }
    }

    fn run_deferred(&mut self, load: &DeferredLoad) {
        let Some(list) = self.local_cache.get(&load.key).map(Arc::clone) else {
            tracing::warn!(property = %load.property, "deferred load found no cached result");
            return;
        };
        if let Some(slot) = extract_slot(&list, load.collection) {
            if let Some(object) = self.arena.get_mut(load.target) {
                object.set(load.property.clone(), slot);
            }
        }
    }

    // ---- lazy loads ----

    pub(crate) fn register_lazy(&mut self, lazy: LazyLoad) -> LoadId {
        let id = LoadId(self.next_load_id);
        self.next_load_id += 1;
        self.lazy_loads.insert(id, lazy);
        id
    }

    /// Trigger the lazy load parked in `handle.property`, if any. Returns
    /// whether a pending slot was resolved. With aggressive lazy loading
    /// enabled, touching one pending slot resolves all of the object's
    /// pending slots.
    pub fn load_pending(&mut self, handle: ObjectHandle, property: &str) -> Result<bool> {
        let loaded = self.load_pending_at(handle, property)?;
        if loaded && self.config.settings.aggressive_lazy_loading {
            self.resolve_object(handle)?;
        }
        Ok(loaded)
    }

    fn load_pending_at(&mut self, handle: ObjectHandle, property: &str) -> Result<bool> {
        self.ensure_open()?;
        let Some(load_id) = self.arena.get(handle).and_then(|o| o.pending(property)) else {
            return Ok(false);
        };
        let Some(lazy) = self.lazy_loads.remove(&load_id) else {
            return Ok(false);
        };
        let list = self.query(&lazy.statement_id, &lazy.bag)?;
        let slot = extract_slot(&list, lazy.collection).unwrap_or(Slot::Value(Value::Null));
        if let Some(object) = self.arena.get_mut(handle) {
            object.set(property.to_string(), slot);
        }
        Ok(true)
    }

    /// Force every pending slot on one object.
    pub fn resolve_object(&mut self, handle: ObjectHandle) -> Result<()> {
        loop {
            let Some(next) = self
                .arena
                .get(handle)
                .and_then(|o| o.pending_loads().next().map(|(p, _)| p.to_string()))
            else {
                return Ok(());
            };
            self.load_pending_at(handle, &next)?;
        }
    }

    fn resolve_deep(&mut self, root: ObjectHandle) -> Result<()> {
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([root]);
        while let Some(handle) = queue.pop_front() {
            if !visited.insert(handle) {
                continue;
            }
            self.resolve_object(handle)?;
            if let Some(object) = self.arena.get(handle) {
                for (_, slot) in object.properties() {
                    match slot {
                        Slot::Object(h) => queue.push_back(*h),
                        Slot::List(items) => {
                            for item in items {
                                if let SlotItem::Object(h) = item {
                                    queue.push_back(*h);
                                }
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
        Ok(())
    }

    /// Render an object tree as JSON, forcing lazy loads first.
    pub fn object_json(&mut self, handle: ObjectHandle) -> Result<serde_json::Value> {
        self.resolve_deep(handle)?;
        Ok(self.arena.object_json(handle))
    }

    /// Structural equality over two object trees, forcing lazy loads first.
    pub fn objects_equal(&mut self, a: ObjectHandle, b: ObjectHandle) -> Result<bool> {
        self.resolve_deep(a)?;
        self.resolve_deep(b)?;
        Ok(self.arena.objects_equal(a, b))
    }
}

/// Statement id, bounds, SQL text, every input parameter in order, and the
/// environment id. Two executions share a key only when all of these agree.
pub(crate) fn build_cache_key(
    config: &Configuration,
    statement: &StatementDescriptor,
    bag: &ParamBag,
    bounds: RowBounds,
    bound: &BoundSql,
) -> CacheKey {
    let mut key = CacheKey::new();
    key.update(&Value::Text(statement.id.clone()));
    key.update(&Value::BigInt(i64::try_from(bounds.offset).unwrap_or(i64::MAX)));
    key.update(&Value::BigInt(i64::try_from(bounds.limit).unwrap_or(i64::MAX)));
    key.update(&Value::Text(bound.sql.clone()));
    for parameter in bound.parameters.iter().filter(|p| p.is_input()) {
        let value = bound
            .parameter_value(bag, &parameter.property)
            .cloned()
            .unwrap_or(Value::Null);
        key.update(&value);
    }
    if !config.environment.is_empty() {
        key.update(&Value::Text(config.environment.clone()));
    }
    key
}

/// Turn a cached result into a property slot: the whole list for collection
/// targets, the single element for one-row lists, nothing otherwise.
pub(crate) fn extract_slot(list: &ResultList, collection: bool) -> Option<Slot> {
    if collection {
        return Some(Slot::List(list.present().map(row_to_item).collect()));
    }
    if list.len() == 1 {
        return Some(match list.get(0) {
            Some(row) => row_to_slot(row),
            None => Slot::Value(Value::Null),
        });
    }
    None
}

pub(crate) fn row_to_slot(row: &RowValue) -> Slot {
    match row {
        RowValue::Value(v) => Slot::Value(v.clone()),
        RowValue::Object(h) => Slot::Object(*h),
    }
}

pub(crate) fn row_to_item(row: &RowValue) -> SlotItem {
    match row {
        RowValue::Value(v) => SlotItem::Value(v.clone()),
        RowValue::Object(h) => SlotItem::Object(*h),
    }
}
