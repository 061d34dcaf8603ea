//! The second-level cache surface shared across sessions.

use crate::key::CacheKey;
use std::collections::HashMap;
use std::sync::Mutex;

/// A namespace-scoped cache shared by every session that references it.
///
/// Implementations must be safe to call from multiple sessions. Sessions
/// never write through this trait directly; staged writes go through the
/// transactional overlay and land here only on commit.
pub trait SharedCache<V>: Send + Sync {
    /// Namespace id, used for registry lookup and logging.
    fn id(&self) -> &str;

    fn get(&self, key: &CacheKey) -> Option<V>;

    fn put(&self, key: CacheKey, value: V);

    fn remove(&self, key: &CacheKey);

    fn clear(&self);

    fn size(&self) -> usize;
}

/// Unbounded in-memory cache, the default backing for a cache namespace.
pub struct InMemoryCache<V> {
    id: String,
    entries: Mutex<HashMap<CacheKey, V>>,
}

impl<V> InMemoryCache<V> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }
}

impl<V: Clone + Send + Sync> SharedCache<V> for InMemoryCache<V> {
    fn id(&self) -> &str {
        &self.id
    }

    fn get(&self, key: &CacheKey) -> Option<V> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).get(key).cloned()
    }

    fn put(&self, key: CacheKey, value: V) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, value);
    }

    fn remove(&self, key: &CacheKey) {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    fn clear(&self) {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    fn size(&self) -> usize {
        self.entries.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlmapper_core::Value;

    fn key(n: i64) -> CacheKey {
        let mut k = CacheKey::new();
        k.update(&Value::BigInt(n));
        k
    }

    #[test]
    fn basic_operations() {
        let cache = InMemoryCache::new("blog");
        assert_eq!(cache.id(), "blog");
        assert_eq!(cache.get(&key(1)), None);

        cache.put(key(1), "rows".to_string());
        assert_eq!(cache.get(&key(1)), Some("rows".to_string()));
        assert_eq!(cache.size(), 1);

        cache.remove(&key(1));
        assert_eq!(cache.get(&key(1)), None);

        cache.put(key(2), "x".to_string());
        cache.clear();
        assert_eq!(cache.size(), 0);
    }
}
