//! txcache - Transaction-aware cache coordination.
//!
//! Lets request handlers invalidate or update entries of a shared cache as
//! part of a database transaction. Other requests see the changes only after
//! the transaction commits; the request itself sees them immediately.
//!
//! ## Architecture
//!
//! - `registry` - Request-scoped singletons with explicit registration
//! - `database` - Transaction/savepoint tracking and commit hooks
//! - `cache` - Shared store, the transaction cache coordinator, typed views
//! - `config` - Environment configuration
//! - `error` - Error types

pub mod cache;
pub mod config;
pub mod database;
pub mod error;
pub mod registry;

pub use cache::{CacheEntry, CacheStore, TransactionCache};
pub use database::{Connection, ScopeId, ScopeTracker};
pub use registry::{ScopedSingletons, SingletonRegistry};
