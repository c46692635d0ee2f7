//! Typed view over the transaction cache.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::rc::Rc;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::{CacheEntry, TransactionCache};

/// A cached lookup result.
#[derive(Debug, Clone, PartialEq)]
pub enum Cached<V> {
    /// A value is cached.
    Value(V),
    /// The key was explicitly invalidated; callers must rebuild the value.
    Invalidated,
}

impl<V> Cached<V> {
    pub fn into_value(self) -> Option<V> {
        match self {
            Cached::Value(v) => Some(v),
            Cached::Invalidated => None,
        }
    }
}

/// Typed, key-prefixed access to a [`TransactionCache`].
///
/// Values are encoded as JSON. Entries that fail to decode are treated as
/// misses, so a format change never breaks readers.
///
/// A view remembers when it was created. `insert` stamps values with that
/// time, so create the view before reading the data the values are built
/// from: an invalidation committed after that point is never overwritten.
pub struct TypedCache<V> {
    cache: Rc<TransactionCache>,
    prefix: Arc<str>,
    generation_start: f64,
    _marker: PhantomData<fn() -> V>,
}

// Manual Clone implementation that doesn't require V: Clone
impl<V> Clone for TypedCache<V> {
    fn clone(&self) -> Self {
        Self {
            cache: Rc::clone(&self.cache),
            prefix: Arc::clone(&self.prefix),
            generation_start: self.generation_start,
            _marker: PhantomData,
        }
    }
}

impl<V> TypedCache<V>
where
    V: Serialize + DeserializeOwned,
{
    /// Create a view storing keys as `{prefix}:{id}`.
    pub fn new(cache: Rc<TransactionCache>, prefix: impl Into<Arc<str>>) -> Self {
        let generation_start = cache.clock().now();
        Self {
            cache,
            prefix: prefix.into(),
            generation_start,
            _marker: PhantomData,
        }
    }

    /// Get the key prefix of this view.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Full cache key of an id.
    pub fn key(&self, id: &str) -> String {
        format!("{}:{}", self.prefix, id)
    }

    /// Get a value from the cache.
    pub fn get(&self, id: &str) -> Option<Cached<V>> {
        let key = self.key(id);
        let entry = self.cache.get(&key)?;
        self.decode(&key, entry)
    }

    /// Get several values, keyed by id.
    pub fn get_many<K: AsRef<str>>(&self, ids: &[K]) -> HashMap<String, Cached<V>> {
        let keys: Vec<String> = ids.iter().map(|id| self.key(id.as_ref())).collect();
        let mut entries = self.cache.get_many(&keys);

        ids.iter()
            .zip(keys)
            .filter_map(|(id, key)| {
                let entry = entries.remove(&key)?;
                let cached = self.decode(&key, entry)?;
                Some((id.as_ref().to_string(), cached))
            })
            .collect()
    }

    /// Time values inserted through this view are stamped with.
    pub fn generation_start(&self) -> f64 {
        self.generation_start
    }

    /// Insert a value built after this view was created.
    ///
    /// Returns `false` if a newer entry is cached and the write was skipped.
    pub fn insert(&self, id: &str, value: &V) -> bool {
        self.insert_at(id, value, self.generation_start)
    }

    /// Insert a value generated at `generated_at`.
    ///
    /// Skipped if the cache holds an entry newer than `generated_at`, since
    /// the value may have been built from data that changed since. Returns
    /// `false` when skipped.
    pub fn insert_at(&self, id: &str, value: &V, generated_at: f64) -> bool {
        let key = self.key(id);
        match serde_json::to_vec(value) {
            Ok(payload) => self
                .cache
                .set_if_newer(key, CacheEntry::new(generated_at, payload)),
            Err(err) => {
                // An unstorable value must not leave an older one readable.
                warn!("Failed to encode '{}': {}", key, err);
                self.cache.invalidate(key);
                false
            }
        }
    }

    /// Invalidate a value.
    pub fn invalidate(&self, id: &str) {
        self.cache.invalidate(self.key(id));
    }

    /// Invalidate several values with a single timestamp.
    pub fn invalidate_many<K: AsRef<str>>(&self, ids: &[K]) {
        self.cache
            .invalidate_many(ids.iter().map(|id| self.key(id.as_ref())));
    }

    fn decode(&self, key: &str, entry: CacheEntry) -> Option<Cached<V>> {
        let Some(payload) = entry.payload else {
            return Some(Cached::Invalidated);
        };

        match serde_json::from_slice(&payload) {
            Ok(value) => Some(Cached::Value(value)),
            Err(err) => {
                warn!("Failed to decode cached '{}': {}", key, err);
                None
            }
        }
    }
}

impl<V> std::fmt::Debug for TypedCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypedCache")
            .field("prefix", &self.prefix)
            .field("generation_start", &self.generation_start)
            .field("cache", &self.cache)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;

    use super::*;
    use crate::cache::{CacheConfig, CacheStore, Clock, LocalCacheStore, ManualClock};
    use crate::database::{Connection, ScopeTracker};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct TableOfContents {
        course_id: u64,
        chapters: Vec<String>,
    }

    type Fixture = (
        Rc<Connection>,
        Arc<LocalCacheStore>,
        Arc<ManualClock>,
        TypedCache<TableOfContents>,
    );

    fn fixture() -> Fixture {
        let store = Arc::new(LocalCacheStore::new("typed", CacheConfig::default()));
        let conn = Rc::new(Connection::new());
        let clock = Arc::new(ManualClock::new(100.0));
        let cache = TransactionCache::new(
            Arc::clone(&store) as Arc<dyn CacheStore>,
            Rc::clone(&conn) as Rc<dyn ScopeTracker>,
            Arc::clone(&clock) as Arc<dyn Clock>,
        );
        (conn, store, clock, TypedCache::new(cache, "course"))
    }

    fn view() -> (Rc<Connection>, Arc<LocalCacheStore>, TypedCache<TableOfContents>) {
        let (conn, store, _clock, view) = fixture();
        (conn, store, view)
    }

    fn toc() -> TableOfContents {
        TableOfContents {
            course_id: 42,
            chapters: vec!["intro".into(), "ownership".into()],
        }
    }

    #[test]
    fn test_insert_then_get() {
        let (_conn, store, view) = view();
        view.insert("42:toc", &toc());

        assert_eq!(view.get("42:toc"), Some(Cached::Value(toc())));
        assert!(store.get("course:42:toc").unwrap().is_some());
        assert_eq!(view.get("43:toc"), None);
    }

    #[test]
    fn test_invalidate_inside_transaction() {
        let (conn, store, view) = view();
        view.insert("42:toc", &toc());

        conn.begin();
        view.invalidate("42:toc");
        assert_eq!(view.get("42:toc"), Some(Cached::Invalidated));
        assert_eq!(
            store.get("course:42:toc").unwrap().map(|e| e.is_invalidation()),
            Some(false)
        );

        conn.commit().unwrap();
        assert_eq!(view.get("42:toc"), Some(Cached::Invalidated));
    }

    #[test]
    fn test_get_many_by_id() {
        let (_conn, _store, view) = view();
        view.insert("1", &toc());
        view.invalidate_many(&["2"]);

        let found = view.get_many(&["1", "2", "3"]);
        assert_eq!(found.len(), 2);
        assert_eq!(found["1"].clone().into_value(), Some(toc()));
        assert_eq!(found["2"], Cached::Invalidated);
    }

    #[test]
    fn test_undecodable_payload_is_a_miss() {
        let (_conn, store, view) = view();
        store
            .set("course:bad", CacheEntry::new(1.0, "not json"))
            .unwrap();

        assert_eq!(view.get("bad"), None);
        assert_eq!(view.key("bad"), "course:bad");
    }

    #[test]
    fn test_insert_keeps_invalidation_committed_after_view_creation() {
        let (_conn, store, clock, view) = fixture();
        assert_eq!(view.get("42:toc"), None);

        // Another worker commits an invalidation while this one reads the row.
        store
            .set("course:42:toc", CacheEntry::invalidation(105.0))
            .unwrap();
        clock.set(110.0);

        assert!(!view.insert("42:toc", &toc()));
        assert_eq!(view.get("42:toc"), Some(Cached::Invalidated));
        assert_eq!(view.generation_start(), 100.0);
    }

    #[test]
    fn test_insert_at_replaces_older_entry() {
        let (conn, store, clock, view) = fixture();
        store
            .set("course:42:toc", CacheEntry::invalidation(90.0))
            .unwrap();
        clock.set(120.0);

        assert!(view.insert_at("42:toc", &toc(), 115.0));
        assert_eq!(view.get("42:toc"), Some(Cached::Value(toc())));

        // An older value does not replace the one just written, even when
        // it is buffered inside a transaction.
        conn.begin();
        let older = TableOfContents {
            course_id: 42,
            chapters: vec![],
        };
        assert!(!view.insert_at("42:toc", &older, 110.0));
        assert_eq!(view.get("42:toc"), Some(Cached::Value(toc())));
        conn.commit().unwrap();
        assert_eq!(
            store.get("course:42:toc").unwrap().map(|e| e.timestamp),
            Some(115.0)
        );
    }
}
