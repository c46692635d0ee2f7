//! Raw shared cache store.

use std::collections::HashMap;
use std::sync::Arc;

use moka::sync::Cache;
use tracing::debug;

use super::{CacheConfig, CacheEntry};
use crate::error::StoreError;

/// Key/value store shared by every thread and process.
///
/// Implementations must be safe to call without external locking. Batch
/// methods default to looping over the single-key ones.
pub trait CacheStore: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError>;

    fn set(&self, key: &str, entry: CacheEntry) -> Result<(), StoreError>;

    /// Get every present key of `keys`.
    fn get_many(&self, keys: &[String]) -> Result<HashMap<String, CacheEntry>, StoreError> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(entry) = self.get(key)? {
                found.insert(key.clone(), entry);
            }
        }
        Ok(found)
    }

    /// Write every item, returning the keys that were rejected.
    fn set_many(&self, items: HashMap<String, CacheEntry>) -> Result<Vec<String>, StoreError> {
        let mut failed = Vec::new();
        for (key, entry) in items {
            match self.set(&key, entry) {
                Ok(()) => {}
                Err(StoreError::EntryTooLarge { .. }) => failed.push(key),
                Err(err) => return Err(err),
            }
        }
        Ok(failed)
    }
}

/// In-process store backed by Moka.
///
/// This store is:
/// - Thread-safe (uses Arc internally)
/// - LRU-based with optional TTL/TTI
/// - Clone-friendly (cloning is cheap, shares the same underlying cache)
/// - Size-capped per entry: oversized payloads are rejected, not truncated
#[derive(Clone)]
pub struct LocalCacheStore {
    inner: Arc<Cache<String, CacheEntry>>,
    name: Arc<str>,
    max_entry_size: usize,
}

impl LocalCacheStore {
    /// Create a new store with the given name and config.
    pub fn new(name: impl Into<Arc<str>>, config: CacheConfig) -> Self {
        let mut builder = Cache::builder().max_capacity(config.max_capacity);

        if let Some(ttl) = config.ttl {
            builder = builder.time_to_live(ttl);
        }

        if let Some(tti) = config.tti {
            builder = builder.time_to_idle(tti);
        }

        let name = name.into();
        debug!("Creating cache store: {}", name);

        Self {
            inner: Arc::new(builder.build()),
            name,
            max_entry_size: config.max_entry_size,
        }
    }

    /// Remove all entries from the store.
    pub fn invalidate_all(&self) {
        self.inner.invalidate_all();
    }

    /// Get the number of entries in the store.
    ///
    /// Note: This may not be perfectly accurate due to concurrent operations.
    pub fn entry_count(&self) -> u64 {
        self.inner.run_pending_tasks();
        self.inner.entry_count()
    }
}

impl CacheStore for LocalCacheStore {
    fn name(&self) -> &str {
        &self.name
    }

    fn get(&self, key: &str) -> Result<Option<CacheEntry>, StoreError> {
        Ok(self.inner.get(key))
    }

    fn set(&self, key: &str, entry: CacheEntry) -> Result<(), StoreError> {
        let size = entry.size();
        if size > self.max_entry_size {
            return Err(StoreError::EntryTooLarge {
                key: key.to_string(),
                size,
                limit: self.max_entry_size,
            });
        }

        self.inner.insert(key.to_string(), entry);
        Ok(())
    }
}

impl std::fmt::Debug for LocalCacheStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalCacheStore")
            .field("name", &self.name)
            .field("entry_count", &self.inner.entry_count())
            .field("max_entry_size", &self.max_entry_size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> LocalCacheStore {
        LocalCacheStore::new("test", CacheConfig::with_capacity(100).max_entry_size(8))
    }

    #[test]
    fn test_set_then_get() {
        let store = store();
        store.set("a", CacheEntry::new(1.0, "value")).unwrap();

        assert_eq!(store.get("a").unwrap(), Some(CacheEntry::new(1.0, "value")));
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn test_oversized_entry_rejected() {
        let store = store();
        let result = store.set("big", CacheEntry::new(1.0, "way too large"));

        assert!(matches!(result, Err(StoreError::EntryTooLarge { limit: 8, .. })));
        assert_eq!(store.get("big").unwrap(), None);
    }

    #[test]
    fn test_set_many_reports_rejected_keys() {
        let store = store();
        let mut items = HashMap::new();
        items.insert("small".to_string(), CacheEntry::new(1.0, "ok"));
        items.insert("big".to_string(), CacheEntry::new(1.0, "way too large"));
        items.insert("gone".to_string(), CacheEntry::invalidation(1.0));

        let failed = store.set_many(items).unwrap();
        assert_eq!(failed, vec!["big".to_string()]);

        let found = store
            .get_many(&["small".to_string(), "big".to_string(), "gone".to_string()])
            .unwrap();
        assert_eq!(found.len(), 2);
        assert!(found["gone"].is_invalidation());
    }

    #[test]
    fn test_clones_share_storage() {
        let store = store();
        let other = store.clone();
        store.set("a", CacheEntry::invalidation(3.0)).unwrap();

        assert!(other.get("a").unwrap().is_some());
        assert_eq!(other.entry_count(), 1);

        other.invalidate_all();
        assert_eq!(store.get("a").unwrap(), None);
    }
}
