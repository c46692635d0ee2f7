//! Cache entry representation.

use serde::{Deserialize, Serialize};

/// A value as stored in the shared cache.
///
/// `payload = None` is an invalidation marker. It is distinct from the key
/// being absent: a marker carries the time the data was invalidated, which
/// later writes are compared against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Seconds since the UNIX epoch when the value was produced.
    pub timestamp: f64,

    /// Encoded value, or `None` for an invalidation marker.
    pub payload: Option<Vec<u8>>,
}

impl CacheEntry {
    /// Create an entry holding a value.
    pub fn new(timestamp: f64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            timestamp,
            payload: Some(payload.into()),
        }
    }

    /// Create an invalidation marker.
    pub fn invalidation(timestamp: f64) -> Self {
        Self {
            timestamp,
            payload: None,
        }
    }

    pub fn is_invalidation(&self) -> bool {
        self.payload.is_none()
    }

    /// Check if `other` was written after this entry.
    pub fn is_older_than(&self, other: &CacheEntry) -> bool {
        self.timestamp < other.timestamp
    }

    /// Size of the payload in bytes.
    pub fn size(&self) -> usize {
        self.payload.as_ref().map_or(0, Vec::len)
    }
}
