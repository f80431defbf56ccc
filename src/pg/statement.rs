//! Per-session cache of server-side prepared statements.
//!
//! Parameterized statements are parsed once per session under a generated
//! name and reused on later sends. The cache is LRU-bounded; an evicted
//! name is handed back so the caller can close it on the server.

use std::num::NonZeroUsize;

use lru::LruCache;

pub struct StatementCache {
    names: LruCache<String, String>,
    next_id: u32,
}

impl StatementCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            names: LruCache::new(capacity),
            next_id: 0,
        }
    }

    /// The statement name for `query`, marking it recently used.
    pub fn lookup(&mut self, query: &str) -> Option<String> {
        self.names.get(query).cloned()
    }

    /// Assign a fresh name to `query`.
    ///
    /// Returns the new name and the name of the statement evicted to make
    /// room for it, if any.
    pub fn assign(&mut self, query: &str) -> (String, Option<String>) {
        let name = format!("pgcore_s{}", self.next_id);
        self.next_id = self.next_id.wrapping_add(1);
        let evicted = self
            .names
            .push(query.to_string(), name.clone())
            .filter(|(key, _)| key != query)
            .map(|(_, evicted)| evicted);
        (name, evicted)
    }

    /// Forget `query`, e.g. because its Parse failed.
    pub fn forget(&mut self, query: &str) {
        self.names.pop(query);
    }

    pub fn clear(&mut self) {
        self.names.clear();
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
