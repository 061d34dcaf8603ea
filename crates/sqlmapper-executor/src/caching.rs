//! Second-level caching wrapped around a session.
//!
//! A [`CachingSession`] consults namespace caches shared across sessions,
//! staging all writes through a transactional overlay so other sessions
//! only ever observe committed results.

use crate::backend::Backend;
use crate::result::ResultList;
use crate::session::Session;
use sqlmapper_cache::{SharedCache, TransactionalCacheManager};
use sqlmapper_core::{
    Error, ParamBag, ParameterMapping, Result, RowBounds, StatementDescriptor, StatementKind,
};
use std::collections::HashMap;
use std::sync::Arc;

type CachedList = Arc<ResultList>;

pub struct CachingSession<B: Backend> {
    inner: Session<B>,
    manager: TransactionalCacheManager<CachedList>,
    caches: HashMap<String, Arc<dyn SharedCache<CachedList>>>,
}

impl<B: Backend> CachingSession<B> {
    pub fn new(inner: Session<B>) -> Self {
        Self {
            inner,
            manager: TransactionalCacheManager::new(),
            caches: HashMap::new(),
        }
    }

    /// Register a shared cache namespace. Statements participate by naming
    /// it in their `cache_ref`.
    pub fn register_cache(&mut self, cache: Arc<dyn SharedCache<CachedList>>) {
        self.caches.insert(cache.id().to_string(), cache);
    }

    pub fn session(&self) -> &Session<B> {
        &self.inner
    }

    pub fn session_mut(&mut self) -> &mut Session<B> {
        &mut self.inner
    }

    fn cache_for(&self, statement: &StatementDescriptor) -> Result<Option<Arc<dyn SharedCache<CachedList>>>> {
        let Some(cache_id) = &statement.cache_ref else {
            return Ok(None);
        };
        self.caches
            .get(cache_id)
            .cloned()
            .map(Some)
            .ok_or_else(|| {
                Error::config(format!(
                    "statement '{}' references unregistered cache '{cache_id}'",
                    statement.id
                ))
            })
    }

    pub fn query(&mut self, statement_id: &str, bag: &ParamBag) -> Result<CachedList> {
        self.query_bounded(statement_id, bag, RowBounds::DEFAULT)
    }

    pub fn query_bounded(
        &mut self,
        statement_id: &str,
        bag: &ParamBag,
        bounds: RowBounds,
    ) -> Result<CachedList> {
        let statement = self.inner.config().statement(statement_id)?;
        let Some(cache) = self.cache_for(&statement)? else {
            return self.inner.query_bounded(statement_id, bag, bounds);
        };
        self.flush_cache_if_required(&statement, &cache);
        if !statement.use_cache {
            return self.inner.query_bounded(statement_id, bag, bounds);
        }
        let bound = statement.bound_sql(bag);
        ensure_no_out_params(&statement, &bound.parameters)?;
        let key = self.inner.create_cache_key(statement_id, bag, bounds)?;
        if let Some(list) = self.manager.get(&cache, &key) {
            tracing::debug!(statement = %statement.id, cache = cache.id(), "shared cache hit");
            return Ok(list);
        }
        let list = self.inner.query_bounded(statement_id, bag, bounds)?;
        self.manager.put(&cache, key, Arc::clone(&list));
        Ok(list)
    }

    pub fn call(&mut self, statement_id: &str, bag: &mut ParamBag) -> Result<CachedList> {
        let statement = self.inner.config().statement(statement_id)?;
        if let Some(cache) = self.cache_for(&statement)? {
            self.flush_cache_if_required(&statement, &cache);
            if statement.use_cache {
                let bound = statement.bound_sql(bag);
                ensure_no_out_params(&statement, &bound.parameters)?;
            }
        }
        // Procedure results never land in the shared cache; output
        // parameters cannot be replayed from it.
        self.inner.call(statement_id, bag)
    }

    pub fn update(&mut self, statement_id: &str, bag: &ParamBag) -> Result<u64> {
        let statement = self.inner.config().statement(statement_id)?;
        if let Some(cache) = self.cache_for(&statement)? {
            self.flush_cache_if_required(&statement, &cache);
        }
        self.inner.update(statement_id, bag)
    }

    fn flush_cache_if_required(
        &mut self,
        statement: &StatementDescriptor,
        cache: &Arc<dyn SharedCache<CachedList>>,
    ) {
        if statement.flush_cache {
            self.manager.clear(cache);
        }
    }

    pub fn commit(&mut self, required: bool) -> Result<()> {
        self.inner.commit(required)?;
        self.manager.commit();
        Ok(())
    }

    pub fn rollback(&mut self, required: bool) -> Result<()> {
        let result = self.inner.rollback(required);
        self.manager.rollback();
        result
    }

    pub fn close(&mut self, force_rollback: bool) {
        if force_rollback {
            self.manager.rollback();
        } else {
            self.manager.commit();
        }
        self.inner.close(force_rollback);
    }
}

/// Caching procedure results is only sound when every parameter flows in;
/// output parameters mutate the caller's bag and cannot be replayed.
fn ensure_no_out_params(
    statement: &StatementDescriptor,
    parameters: &[ParameterMapping],
) -> Result<()> {
    if !matches!(statement.kind, StatementKind::Call) {
        return Ok(());
    }
    for parameter in parameters {
        if parameter.is_output() {
            return Err(Error::config(format!(
                "caching statement '{}' with output parameter '{}' is not supported; \
                 disable use_cache on the statement",
                statement.id, parameter.property
            )));
        }
    }
    Ok(())
}
