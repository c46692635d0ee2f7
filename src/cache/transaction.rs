//! Transaction-aware cache coordinator.
//!
//! Writes made inside a database transaction are buffered in one memo layer
//! per open scope and only reach the shared store after the outermost
//! transaction commits. Reads inside the transaction see the buffered writes.
//!
//! Buffered data is never trusted blindly: if the shared store holds an entry
//! newer than the buffered one, some other writer touched the key after the
//! buffer was made. Reads then report a miss and the flush writes an
//! invalidation marker instead of the buffered value.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use tracing::{debug, warn};

use super::{CacheEntry, CacheStore, Clock};
use crate::database::{Connection, ScopeId, ScopeListener, ScopeTracker};
use crate::error::RegistryError;
use crate::registry::RegistryBuilder;

/// Buffered writes of one scope.
#[derive(Debug)]
struct MemoLayer {
    scope: ScopeId,
    entries: HashMap<String, CacheEntry>,
}

impl MemoLayer {
    fn new(scope: ScopeId) -> Self {
        Self {
            scope,
            entries: HashMap::new(),
        }
    }
}

#[derive(Debug, Default)]
struct MemoState {
    /// Outermost first. Mirrors the tracker's scopes after every resync.
    layers: Vec<MemoLayer>,
    /// Outermost scope whose flush is registered with the tracker.
    pending_flush: Option<ScopeId>,
    passthrough_logged: bool,
}

/// Cache front that defers writes until the surrounding transaction commits.
///
/// One instance serves one request on one thread. No operation fails:
/// store errors are logged and degrade to cache misses.
pub struct TransactionCache {
    store: Arc<dyn CacheStore>,
    tracker: Rc<dyn ScopeTracker>,
    clock: Arc<dyn Clock>,
    state: RefCell<MemoState>,
    this: Weak<TransactionCache>,
}

impl TransactionCache {
    /// Create a coordinator and subscribe it to the tracker's savepoint hooks.
    pub fn new(
        store: Arc<dyn CacheStore>,
        tracker: Rc<dyn ScopeTracker>,
        clock: Arc<dyn Clock>,
    ) -> Rc<Self> {
        let cache = Rc::new_cyclic(|this| Self {
            store,
            tracker,
            clock,
            state: RefCell::new(MemoState::default()),
            this: this.clone(),
        });

        let listener: Weak<dyn ScopeListener> = Rc::downgrade(&cache) as Weak<dyn ScopeListener>;
        cache.tracker.subscribe(listener);
        cache
    }

    /// Register the coordinator as a scoped singleton.
    ///
    /// Each request gets its own coordinator bound to the request's
    /// `Connection`, sharing `store` with every other request.
    pub fn register(
        builder: RegistryBuilder,
        store: Arc<dyn CacheStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<RegistryBuilder, RegistryError> {
        builder.register::<TransactionCache, _>(move |scope| {
            let conn: Rc<dyn ScopeTracker> = scope.instance::<Connection>()?;
            Ok(TransactionCache::new(Arc::clone(&store), conn, Arc::clone(&clock)))
        })
    }

    /// Get the clock entries are stamped with.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Get an entry, preferring this transaction's own writes.
    pub fn get(&self, key: &str) -> Option<CacheEntry> {
        let buffered = {
            let mut state = self.state.borrow_mut();
            if !self.resync(&mut state) {
                drop(state);
                return self.store_get(key);
            }
            innermost(&state.layers, key).cloned()
        };

        let stored = self.store_get(key);
        let Some(entry) = buffered else {
            return stored;
        };

        match stored {
            Some(stored) if entry.is_older_than(&stored) => {
                debug!("Buffered entry for '{}' is stale, reporting a miss", key);
                None
            }
            _ => Some(entry),
        }
    }

    /// Get several entries. Equivalent to calling `get` for each key.
    pub fn get_many<K: AsRef<str>>(&self, keys: &[K]) -> HashMap<String, CacheEntry> {
        let keys: Vec<String> = keys.iter().map(|k| k.as_ref().to_string()).collect();

        let buffered: Vec<(String, CacheEntry)> = {
            let mut state = self.state.borrow_mut();
            if !self.resync(&mut state) {
                drop(state);
                return self.store_get_many(&keys).unwrap_or_default();
            }
            keys.iter()
                .filter_map(|k| innermost(&state.layers, k).map(|e| (k.clone(), e.clone())))
                .collect()
        };

        let mut items = self.store_get_many(&keys).unwrap_or_default();
        for (key, entry) in buffered {
            match items.get(&key) {
                Some(stored) if entry.is_older_than(stored) => {
                    debug!("Buffered entry for '{}' is stale, reporting a miss", key);
                    items.remove(&key);
                }
                _ => {
                    items.insert(key, entry);
                }
            }
        }

        items
    }

    /// Write an entry, buffering it if a transaction is open.
    pub fn set(&self, key: impl Into<String>, entry: CacheEntry) {
        let key = key.into();
        let mut state = self.state.borrow_mut();
        if !self.resync(&mut state) {
            drop(state);
            self.store_set(&key, entry);
            return;
        }

        if let Some(layer) = state.layers.last_mut() {
            layer.entries.insert(key, entry);
        }
        self.schedule_flush(&mut state);
    }

    /// Write several entries, buffering them if a transaction is open.
    pub fn set_many(&self, items: HashMap<String, CacheEntry>) {
        if items.is_empty() {
            return;
        }

        let mut state = self.state.borrow_mut();
        if !self.resync(&mut state) {
            drop(state);
            self.store_set_many(items);
            return;
        }

        if let Some(layer) = state.layers.last_mut() {
            layer.entries.extend(items);
        }
        self.schedule_flush(&mut state);
    }

    /// Write an entry unless the cache already holds a newer one.
    ///
    /// For values built from database reads: stamp the entry with the time
    /// the read started, so an invalidation committed meanwhile wins.
    /// Returns `false` if the write was skipped.
    pub fn set_if_newer(&self, key: impl Into<String>, entry: CacheEntry) -> bool {
        let key = key.into();
        if let Some(current) = self.get(&key)
            && entry.is_older_than(&current)
        {
            debug!("Cache holds a newer entry for '{}', skipping write", key);
            return false;
        }

        self.set(key, entry);
        true
    }

    /// Invalidate a key as of now.
    pub fn invalidate(&self, key: impl Into<String>) {
        self.set(key, CacheEntry::invalidation(self.clock.now()));
    }

    /// Invalidate several keys with a single timestamp.
    pub fn invalidate_many<I, K>(&self, keys: I)
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let marker = CacheEntry::invalidation(self.clock.now());
        let items = keys
            .into_iter()
            .map(|k| (k.into(), marker.clone()))
            .collect();
        self.set_many(items);
    }

    /// Number of memo layers, i.e. the current scope depth.
    pub fn depth(&self) -> usize {
        let mut state = self.state.borrow_mut();
        self.resync(&mut state);
        state.layers.len()
    }

    /// Number of buffered entries across all layers.
    pub fn buffered_len(&self) -> usize {
        let mut state = self.state.borrow_mut();
        self.resync(&mut state);
        state.layers.iter().map(|l| l.entries.len()).sum()
    }

    /// Check if the tracker cannot report transaction state.
    pub fn is_passthrough(&self) -> bool {
        self.tracker.current_scopes().is_none()
    }

    /// Bring the memo stack in line with the tracker's scopes.
    ///
    /// Returns `true` if writes must be buffered.
    fn resync(&self, state: &mut MemoState) -> bool {
        let Some(scopes) = self.tracker.current_scopes() else {
            if !state.passthrough_logged {
                warn!("Backend reports no transaction state, cache writes go straight to the store");
                state.passthrough_logged = true;
            }
            state.layers.clear();
            return false;
        };

        state.layers.truncate(scopes.len());
        for (depth, scope) in scopes.iter().enumerate() {
            if state.layers.get(depth).is_some_and(|l| l.scope == *scope) {
                continue;
            }
            // A different scope at this depth: everything from here on
            // belongs to scopes that have already closed.
            state.layers.truncate(depth);
            state.layers.push(MemoLayer::new(*scope));
        }

        !state.layers.is_empty()
    }

    fn schedule_flush(&self, state: &mut MemoState) {
        let Some(outermost) = state.layers.first().map(|l| l.scope) else {
            return;
        };
        if state.pending_flush == Some(outermost) {
            return;
        }

        let this = self.this.clone();
        let registered = self.tracker.on_outer_commit(Box::new(move || {
            if let Some(cache) = this.upgrade() {
                cache.flush(outermost);
            }
        }));

        if registered {
            debug!("Cache flush scheduled for {}", outermost);
            state.pending_flush = Some(outermost);
        } else {
            warn!("Could not schedule cache flush for {}", outermost);
        }
    }

    /// Write the committed transaction's buffer to the store.
    fn flush(&self, scope: ScopeId) {
        let layer = {
            let mut state = self.state.borrow_mut();
            if state.pending_flush == Some(scope) {
                state.pending_flush = None;
            }

            if self.tracker.current_scopes().is_some_and(|s| !s.is_empty()) {
                debug!("Flush for {} skipped, still inside a transaction", scope);
                return;
            }

            match state.layers.first() {
                Some(layer) if layer.scope == scope => {}
                _ => return,
            }

            let mut layers = std::mem::take(&mut state.layers);
            layers.swap_remove(0)
        };

        if layer.entries.is_empty() {
            return;
        }

        let now = self.clock.now();
        let mut memo: HashMap<String, CacheEntry> = layer
            .entries
            .into_iter()
            .map(|(key, entry)| {
                // Restamp so other readers distrust the store only from commit time.
                if entry.is_invalidation() {
                    (key, CacheEntry::invalidation(now))
                } else {
                    (key, entry)
                }
            })
            .collect();

        let keys: Vec<String> = memo.keys().cloned().collect();
        match self.store_get_many(&keys) {
            Some(stored) => {
                for (key, entry) in memo.iter_mut() {
                    if stored.get(key).is_some_and(|s| entry.is_older_than(s)) {
                        // Neither value can be trusted.
                        debug!("Store has a newer entry for '{}', invalidating", key);
                        *entry = CacheEntry::invalidation(now);
                    }
                }
            }
            None => {
                for entry in memo.values_mut() {
                    *entry = CacheEntry::invalidation(now);
                }
            }
        }

        debug!("Flushing {} cache entries for {}", memo.len(), scope);
        self.store_set_many(memo);
    }

    fn store_get(&self, key: &str) -> Option<CacheEntry> {
        match self.store.get(key) {
            Ok(entry) => entry,
            Err(err) => {
                warn!("Cache read of '{}' from {} failed: {}", key, self.store.name(), err);
                None
            }
        }
    }

    fn store_get_many(&self, keys: &[String]) -> Option<HashMap<String, CacheEntry>> {
        match self.store.get_many(keys) {
            Ok(items) => Some(items),
            Err(err) => {
                warn!("Cache batch read from {} failed: {}", self.store.name(), err);
                None
            }
        }
    }

    fn store_set(&self, key: &str, entry: CacheEntry) {
        if let Err(err) = self.store.set(key, entry) {
            warn!("Failed to save '{}' in the cache: {}", key, err);
        }
    }

    fn store_set_many(&self, items: HashMap<String, CacheEntry>) {
        match self.store.set_many(items) {
            Ok(failed) if !failed.is_empty() => {
                warn!("Failed to save the following in the cache: {}", failed.join("; "));
            }
            Ok(_) => {}
            Err(err) => warn!("Cache batch write to {} failed: {}", self.store.name(), err),
        }
    }
}

impl ScopeListener for TransactionCache {
    fn on_savepoint_commit(&self, scope: ScopeId) {
        let mut state = self.state.borrow_mut();
        let Some(index) = state.layers.iter().position(|l| l.scope == scope) else {
            return;
        };
        if index == 0 {
            return;
        }

        let merged: Vec<MemoLayer> = state.layers.drain(index..).collect();
        let parent = &mut state.layers[index - 1];
        for layer in merged {
            parent.entries.extend(layer.entries);
        }
    }

    fn on_savepoint_rollback(&self, scope: ScopeId) {
        let mut state = self.state.borrow_mut();
        if let Some(index) = state.layers.iter().position(|l| l.scope == scope) {
            state.layers.truncate(index);
        }
    }
}

impl std::fmt::Debug for TransactionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("TransactionCache")
            .field("store", &self.store.name())
            .field("layers", &state.layers.len())
            .field("pending_flush", &state.pending_flush)
            .finish()
    }
}

fn innermost<'a>(layers: &'a [MemoLayer], key: &str) -> Option<&'a CacheEntry> {
    layers.iter().rev().find_map(|l| l.entries.get(key))
}
