//! Cache module - Transaction-aware caching over a shared store.
//!
//! ## Architecture
//!
//! - `CacheStore` - The raw shared store (`LocalCacheStore` is Moka-backed)
//! - `TransactionCache` - Per-request coordinator that buffers writes made
//!   inside a database transaction and flushes them after commit
//! - `TypedCache` - Typed, JSON-encoded view over a coordinator
//!
//! ## Usage
//!
//! ```rust,ignore
//! let cache = singletons.instance::<TransactionCache>()?;
//!
//! conn.begin();
//! cache.invalidate("course:42:toc");
//! // Visible to this request only.
//! assert!(cache.get("course:42:toc").unwrap().is_invalidation());
//! conn.commit()?;
//! // Now visible to everyone.
//! ```

mod clock;
mod config;
mod entry;
mod store;
mod transaction;
mod typed;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use entry::CacheEntry;
pub use store::{CacheStore, LocalCacheStore};
pub use transaction::TransactionCache;
pub use typed::{Cached, TypedCache};
