//! Transaction-aware connection wrapper.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use tracing::debug;

use super::scope::{ScopeId, ScopeListener, ScopeTracker};
use crate::error::TransactionError;
use crate::registry::ScopedSingleton;

#[derive(Default)]
struct ConnectionState {
    scopes: Vec<ScopeId>,
    on_commit: Vec<Box<dyn FnOnce()>>,
    listeners: Vec<Weak<dyn ScopeListener>>,
}

/// Wrapper the host composes around its database driver.
///
/// The host calls `begin`/`commit`/`rollback` in step with the real
/// transaction; the wrapper mints scope ids and fires the hooks. Every hook
/// runs after the internal state is updated and no borrow is held, so hooks
/// may query the connection again.
#[derive(Default)]
pub struct Connection {
    state: RefCell<ConnectionState>,
}

impl Connection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check if a transaction is open.
    pub fn is_in_transaction(&self) -> bool {
        !self.state.borrow().scopes.is_empty()
    }

    #[cfg(test)]
    fn depth(&self) -> usize {
        self.state.borrow().scopes.len()
    }

    /// Open a transaction, or a savepoint if one is already open.
    pub fn begin(&self) -> ScopeId {
        let scope = ScopeId::next();
        let mut state = self.state.borrow_mut();
        state.scopes.push(scope);

        if state.scopes.len() == 1 {
            debug!("Transaction {} started", scope);
        } else {
            debug!("Savepoint {} created at depth {}", scope, state.scopes.len());
        }

        scope
    }

    /// Commit the innermost scope.
    pub fn commit(&self) -> Result<ScopeId, TransactionError> {
        let (scope, outermost) = self.pop()?;

        if outermost {
            let callbacks = std::mem::take(&mut self.state.borrow_mut().on_commit);
            debug!("Transaction {} committed, running {} hooks", scope, callbacks.len());
            for callback in callbacks {
                callback();
            }
        } else {
            debug!("Savepoint {} released", scope);
            for listener in self.live_listeners() {
                listener.on_savepoint_commit(scope);
            }
        }

        Ok(scope)
    }

    /// Roll back the innermost scope.
    pub fn rollback(&self) -> Result<ScopeId, TransactionError> {
        let (scope, outermost) = self.pop()?;

        if outermost {
            let discarded = std::mem::take(&mut self.state.borrow_mut().on_commit);
            debug!(
                "Transaction {} rolled back, discarding {} hooks",
                scope,
                discarded.len()
            );
            drop(discarded);
        } else {
            debug!("Savepoint {} rolled back", scope);
            for listener in self.live_listeners() {
                listener.on_savepoint_rollback(scope);
            }
        }

        Ok(scope)
    }

    /// Run `f` inside a new scope.
    ///
    /// Commits when `f` returns `Ok`, rolls back when it returns `Err`.
    pub fn atomic<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Self) -> Result<T, E>,
        E: From<TransactionError>,
    {
        let scope = self.begin();
        let result = f(self);

        if self.state.borrow().scopes.last() != Some(&scope) {
            return Err(TransactionError::Unbalanced(scope).into());
        }

        match result {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(err) => {
                self.rollback()?;
                Err(err)
            }
        }
    }

    fn pop(&self) -> Result<(ScopeId, bool), TransactionError> {
        let mut state = self.state.borrow_mut();
        let scope = state.scopes.pop().ok_or(TransactionError::NoActiveScope)?;
        Ok((scope, state.scopes.is_empty()))
    }

    fn live_listeners(&self) -> Vec<Rc<dyn ScopeListener>> {
        let mut state = self.state.borrow_mut();
        state.listeners.retain(|l| l.strong_count() > 0);
        state.listeners.iter().filter_map(Weak::upgrade).collect()
    }
}

impl ScopeTracker for Connection {
    fn current_scopes(&self) -> Option<Vec<ScopeId>> {
        Some(self.state.borrow().scopes.clone())
    }

    fn on_outer_commit(&self, callback: Box<dyn FnOnce()>) -> bool {
        let mut state = self.state.borrow_mut();
        if state.scopes.is_empty() {
            return false;
        }
        state.on_commit.push(callback);
        true
    }

    fn subscribe(&self, listener: Weak<dyn ScopeListener>) {
        let mut state = self.state.borrow_mut();
        state.listeners.retain(|l| l.strong_count() > 0);
        state.listeners.push(listener);
    }
}

impl ScopedSingleton for Connection {
    fn init() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.borrow();
        f.debug_struct("Connection")
            .field("scopes", &state.scopes)
            .field("pending_hooks", &state.on_commit.len())
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        events: RefCell<Vec<(&'static str, ScopeId)>>,
    }

    impl ScopeListener for Recorder {
        fn on_savepoint_commit(&self, scope: ScopeId) {
            self.events.borrow_mut().push(("commit", scope));
        }

        fn on_savepoint_rollback(&self, scope: ScopeId) {
            self.events.borrow_mut().push(("rollback", scope));
        }
    }

    #[test]
    fn test_scopes_nest_outermost_first() {
        let conn = Connection::new();
        assert_eq!(conn.current_scopes(), Some(vec![]));

        let outer = conn.begin();
        let inner = conn.begin();
        assert_eq!(conn.current_scopes(), Some(vec![outer, inner]));
        assert_eq!(conn.depth(), 2);

        conn.commit().unwrap();
        assert_eq!(conn.current_scopes(), Some(vec![outer]));
        conn.commit().unwrap();
        assert!(!conn.is_in_transaction());
    }

    #[test]
    fn test_commit_without_scope_fails() {
        let conn = Connection::new();
        assert_eq!(conn.commit(), Err(TransactionError::NoActiveScope));
        assert_eq!(conn.rollback(), Err(TransactionError::NoActiveScope));
    }

    #[test]
    fn test_savepoint_hooks_fire_after_state_change() {
        let conn = Connection::new();
        let recorder = Rc::new(Recorder::default());
        let weak: Weak<dyn ScopeListener> = Rc::downgrade(&recorder) as Weak<dyn ScopeListener>;
        conn.subscribe(weak);

        conn.begin();
        let first = conn.begin();
        conn.commit().unwrap();
        let second = conn.begin();
        conn.rollback().unwrap();
        conn.commit().unwrap();

        assert_eq!(
            *recorder.events.borrow(),
            vec![("commit", first), ("rollback", second)]
        );
    }

    #[test]
    fn test_on_commit_runs_once_after_outer_commit() {
        let conn = Rc::new(Connection::new());
        let ran = Rc::new(Cell::new(0));
        assert!(!conn.on_outer_commit(Box::new(|| {})));

        conn.begin();
        conn.begin();
        let seen_open = Rc::new(Cell::new(true));
        {
            let ran = Rc::clone(&ran);
            let conn_ref = Rc::clone(&conn);
            let seen_open = Rc::clone(&seen_open);
            assert!(conn.on_outer_commit(Box::new(move || {
                ran.set(ran.get() + 1);
                seen_open.set(conn_ref.is_in_transaction());
            })));
        }

        conn.commit().unwrap();
        assert_eq!(ran.get(), 0);
        conn.commit().unwrap();
        assert_eq!(ran.get(), 1);
        assert!(!seen_open.get());

        conn.begin();
        conn.commit().unwrap();
        assert_eq!(ran.get(), 1);
    }

    #[test]
    fn test_on_commit_discarded_on_rollback() {
        let conn = Connection::new();
        let ran = Rc::new(Cell::new(false));

        conn.begin();
        let flag = Rc::clone(&ran);
        conn.on_outer_commit(Box::new(move || flag.set(true)));
        conn.rollback().unwrap();

        assert!(!ran.get());
    }

    #[test]
    fn test_dead_listeners_are_pruned() {
        let conn = Connection::new();
        {
            let recorder = Rc::new(Recorder::default());
            conn.subscribe(Rc::downgrade(&recorder) as Weak<dyn ScopeListener>);
        }

        conn.begin();
        conn.begin();
        conn.commit().unwrap();
        assert!(conn.live_listeners().is_empty());
    }

    #[test]
    fn test_atomic_commits_and_rolls_back() {
        let conn = Connection::new();

        let ok: Result<u32, TransactionError> = conn.atomic(|c| {
            assert_eq!(c.depth(), 1);
            Ok(7)
        });
        assert_eq!(ok, Ok(7));
        assert!(!conn.is_in_transaction());

        let err: Result<(), TransactionError> = conn.atomic(|_| Err(TransactionError::NoActiveScope));
        assert!(err.is_err());
        assert!(!conn.is_in_transaction());
    }
}
