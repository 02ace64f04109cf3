//! Bounded in-memory document cache kept fresh by the change feed.
//!
//! [`DocumentCache`] stores documents by id with least-recently-used eviction
//! and implements [`Cache`], so registering it with a
//! [`ChangeSession`](crate::changes::ChangeSession) drops every entry whose
//! document changed on the server.
//!
//! # Examples
//!
//! ```
//! use couch_feed::cache::DocumentCache;
//! use couch_feed::changes::Cache;
//! use serde_json::json;
//!
//! let cache = DocumentCache::new(2);
//! cache.insert("a", json!({"n": 1}));
//! assert!(cache.get("a").is_some());
//!
//! cache.invalidate("a").unwrap();
//! assert!(cache.get("a").is_none());
//! ```

use crate::changes::Cache;
use lru::LruCache;
use parking_lot::Mutex;
use serde_json::Value;
use std::num::NonZeroUsize;

/// Thread-safe LRU cache of JSON documents keyed by id.
pub struct DocumentCache {
    entries: Mutex<LruCache<String, Value>>,
}

impl DocumentCache {
    /// Create a cache holding at most `capacity` documents (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        DocumentCache {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Cached document, marking it recently used
    pub fn get(&self, id: &str) -> Option<Value> {
        self.entries.lock().get(id).cloned()
    }

    /// Store a document, evicting the least recently used one if full
    pub fn insert(&self, id: impl Into<String>, doc: Value) {
        self.entries.lock().put(id.into(), doc);
    }

    /// Whether `id` is cached, without touching recency
    pub fn contains(&self, id: &str) -> bool {
        self.entries.lock().contains(id)
    }

    /// Number of cached documents
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Cache for DocumentCache {
    fn invalidate(&self, id: &str) -> anyhow::Result<()> {
        if self.entries.lock().pop(id).is_some() {
            tracing::trace!(id, "Invalidated cached document");
        }
        Ok(())
    }
}
