//! TTL cache used for merged listings, deletion presence, and tree
//! metadata.
//!
//! Entries carry their insertion timestamp and age out lazily at access
//! time; there is no background sweeper. Each mount session owns its own
//! cache instances so concurrent mounts in one process never share state.

use std::hash::Hash;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// One cached value with its insertion time and lifetime.
#[derive(Debug, Clone)]
struct Entry<V> {
    value: V,
    inserted: Instant,
    ttl: Duration,
}

/// Map from keys to values that expire after a time-to-live.
///
/// Backed by a sharded map so operations on unrelated keys do not
/// serialize. A `get` past the TTL removes the entry and reports a miss;
/// the caller recomputes and re-inserts.
pub struct TtlCache<K, V> {
    entries: DashMap<K, Entry<V>>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache whose entries live for `ttl` by default.
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Get a value if present and younger than its TTL.
    ///
    /// # Arguments
    /// * `key` - Cache key
    ///
    /// # Returns
    /// The cached value, or None when absent or stale.
    pub fn get(&self, key: &K) -> Option<V> {
        let stale: bool = match self.entries.get(key) {
            Some(e) if e.inserted.elapsed() <= e.ttl => return Some(e.value.clone()),
            Some(_) => true,
            None => false,
        };
        if stale {
            self.entries.remove(key);
        }
        None
    }

    /// Insert a value with the cache's default TTL.
    pub fn insert(&self, key: K, value: V) {
        self.insert_with_ttl(key, value, self.ttl);
    }

    /// Insert a value with an explicit TTL (negative entries use a
    /// shorter lifetime than positive ones).
    pub fn insert_with_ttl(&self, key: K, value: V, ttl: Duration) {
        self.entries.insert(
            key,
            Entry {
                value,
                inserted: Instant::now(),
                ttl,
            },
        );
    }

    /// Drop an entry unconditionally. Called by any write touching the
    /// cached path.
    pub fn invalidate(&self, key: &K) {
        self.entries.remove(key);
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of entries currently stored (stale entries included until
    /// their next access).
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
