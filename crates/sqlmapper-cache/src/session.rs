//! The first-level (per-session) cache.

use crate::key::CacheKey;
use std::collections::HashMap;

/// What a lookup found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup<V> {
    /// Nothing under this key.
    Miss,
    /// A placeholder: the same key is currently executing further up the
    /// stack and has not produced a result yet.
    InFlight,
    /// A resolved result.
    Hit(V),
}

#[derive(Debug, Clone)]
enum Entry<V> {
    InFlight,
    Resolved(V),
}

/// Session-scoped read-through cache with in-flight placeholders.
///
/// Before a statement executes, a placeholder is parked under its key so
/// nested loads can tell "currently executing" from "absent". The
/// placeholder is removed on both success and failure; only a resolved
/// value survives.
#[derive(Debug)]
pub struct SessionCache<V> {
    entries: HashMap<CacheKey, Entry<V>>,
}

impl<V> SessionCache<V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    pub fn lookup(&self, key: &CacheKey) -> CacheLookup<&V> {
        match self.entries.get(key) {
            None => CacheLookup::Miss,
            Some(Entry::InFlight) => CacheLookup::InFlight,
            Some(Entry::Resolved(v)) => CacheLookup::Hit(v),
        }
    }

    /// A resolved value, ignoring placeholders.
    pub fn get(&self, key: &CacheKey) -> Option<&V> {
        match self.entries.get(key) {
            Some(Entry::Resolved(v)) => Some(v),
            _ => None,
        }
    }

    /// Is a resolved value present for this key? Used by deferred loads to
    /// decide whether they can run now.
    pub fn has_resolved(&self, key: &CacheKey) -> bool {
        matches!(self.entries.get(key), Some(Entry::Resolved(_)))
    }

    /// Park a placeholder before executing.
    pub fn put_placeholder(&mut self, key: CacheKey) {
        self.entries.insert(key, Entry::InFlight);
    }

    /// Replace whatever is under the key with a resolved value.
    pub fn put(&mut self, key: CacheKey, value: V) {
        self.entries.insert(key, Entry::Resolved(value));
    }

    pub fn remove(&mut self, key: &CacheKey) -> Option<V> {
        match self.entries.remove(key) {
            Some(Entry::Resolved(v)) => Some(v),
            _ => None,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<V> Default for SessionCache<V> {
    fn default() -> Self {
        Self::new()
    }
}
