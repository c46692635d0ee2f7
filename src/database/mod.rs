//! Database transaction tracking.
//!
//! The cache layer never talks to a driver directly. It sees the connection
//! through `ScopeTracker` (what is open right now) and `ScopeListener`
//! (savepoint hooks); `Connection` is the wrapper a host puts around its
//! driver to provide both.

mod connection;
mod scope;

pub use connection::Connection;
pub use scope::{ScopeId, ScopeListener, ScopeTracker, UnsupportedBackend};
