//! Transactional overlay that defers shared-cache writes until commit.

use crate::key::CacheKey;
use crate::shared::SharedCache;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Per-session staging area in front of one shared cache.
///
/// Reads pass through to the shared cache; writes are staged locally and
/// only flushed on commit, so other sessions never observe uncommitted
/// results. Clearing is likewise deferred: after a session-local clear,
/// reads report misses even though the shared cache still holds entries,
/// and the shared cache is cleared only when the session commits.
pub struct TransactionalCache<V> {
    delegate: Arc<dyn SharedCache<V>>,
    clear_on_commit: bool,
    staged: HashMap<CacheKey, V>,
    missed: HashSet<CacheKey>,
}

impl<V: Clone> TransactionalCache<V> {
    pub fn new(delegate: Arc<dyn SharedCache<V>>) -> Self {
        Self {
            delegate,
            clear_on_commit: false,
            staged: HashMap::new(),
            missed: HashSet::new(),
        }
    }

    pub fn get(&mut self, key: &CacheKey) -> Option<V> {
        let value = self.delegate.get(key);
        if value.is_none() {
            self.missed.insert(key.clone());
        }
        // After a local clear the shared entries are dead to this session.
        if self.clear_on_commit {
            return None;
        }
        value
    }

    pub fn put(&mut self, key: CacheKey, value: V) {
        self.staged.insert(key, value);
    }

    pub fn clear(&mut self) {
        self.clear_on_commit = true;
        self.staged.clear();
    }

    pub fn commit(&mut self) {
        if self.clear_on_commit {
            tracing::debug!(cache = self.delegate.id(), "clearing shared cache on commit");
            self.delegate.clear();
        }
        for (key, value) in self.staged.drain() {
            self.delegate.put(key, value);
        }
        self.reset();
    }

    pub fn rollback(&mut self) {
        for key in self.missed.drain() {
            self.delegate.remove(&key);
        }
        self.reset();
    }

    fn reset(&mut self) {
        self.clear_on_commit = false;
        self.staged.clear();
        self.missed.clear();
    }
}

/// Tracks one transactional overlay per shared cache touched by a session.
pub struct TransactionalCacheManager<V> {
    overlays: HashMap<String, TransactionalCache<V>>,
}

impl<V: Clone> TransactionalCacheManager<V> {
    pub fn new() -> Self {
        Self {
            overlays: HashMap::new(),
        }
    }

    fn overlay(&mut self, cache: &Arc<dyn SharedCache<V>>) -> &mut TransactionalCache<V> {
        self.overlays
            .entry(cache.id().to_string())
            .or_insert_with(|| TransactionalCache::new(Arc::clone(cache)))
    }

    pub fn get(&mut self, cache: &Arc<dyn SharedCache<V>>, key: &CacheKey) -> Option<V> {
        self.overlay(cache).get(key)
    }

    pub fn put(&mut self, cache: &Arc<dyn SharedCache<V>>, key: CacheKey, value: V) {
        self.overlay(cache).put(key, value);
    }

    pub fn clear(&mut self, cache: &Arc<dyn SharedCache<V>>) {
        self.overlay(cache).clear();
    }

    pub fn commit(&mut self) {
        for overlay in self.overlays.values_mut() {
            overlay.commit();
        }
    }

    pub fn rollback(&mut self) {
        for overlay in self.overlays.values_mut() {
            overlay.rollback();
        }
    }
}

impl<V: Clone> Default for TransactionalCacheManager<V> {
    fn default() -> Self {
        Self::new()
    }
}
