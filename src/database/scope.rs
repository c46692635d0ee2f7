//! Transaction scope identity and tracking contracts.

use std::rc::Weak;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of an open transaction or savepoint.
///
/// Minted from a process-wide counter whenever a scope is opened, so ids are
/// never reused, even across threads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ScopeId(u64);

impl ScopeId {
    /// Mint a fresh id.
    pub fn next() -> Self {
        Self(NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for ScopeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "scope#{}", self.0)
    }
}

/// Receives notifications when an inner scope closes.
///
/// Called synchronously, in the thread that closed the scope, after the
/// savepoint has been released or rolled back.
pub trait ScopeListener {
    fn on_savepoint_commit(&self, scope: ScopeId);
    fn on_savepoint_rollback(&self, scope: ScopeId);
}

/// Read access to the live transaction nesting of a connection.
pub trait ScopeTracker {
    /// Active scopes, outermost first.
    ///
    /// `Some(vec![])` outside a transaction, `None` if the backend cannot
    /// report transaction state at all.
    fn current_scopes(&self) -> Option<Vec<ScopeId>>;

    /// Queue `callback` to run once the outermost transaction has durably
    /// committed. Returns `false` if no transaction is open.
    fn on_outer_commit(&self, callback: Box<dyn FnOnce()>) -> bool;

    /// Register for savepoint notifications.
    ///
    /// Trackers without hooks ignore this; listeners then only see changes
    /// through `current_scopes()`.
    fn subscribe(&self, _listener: Weak<dyn ScopeListener>) {}
}

/// Tracker for a backend without transaction introspection.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedBackend;

impl ScopeTracker for UnsupportedBackend {
    fn current_scopes(&self) -> Option<Vec<ScopeId>> {
        None
    }

    fn on_outer_commit(&self, _callback: Box<dyn FnOnce()>) -> bool {
        false
    }
}
