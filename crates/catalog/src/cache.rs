//! Transaction-id keyed result caches.
//!
//! Each entry remembers the last-known relevant txid for its key. A lookup
//! supplies the authoritative latest txid (a small query over the change
//! tracking relations) and the entry is trusted only if it is at least as
//! new; otherwise it is discarded. Writes are last-writer-wins: a racing
//! stale write costs a redundant recomputation, never a wrong answer.

use curio_core::config::CacheConfig;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::{Duration, Instant};

struct Entry<V> {
    txid: i64,
    value: V,
    touched: Instant,
}

/// A txid-validated cache. Initialized once at process start; no implicit
/// global state.
pub struct TxCache<K, V> {
    entries: Mutex<HashMap<K, Entry<V>>>,
    staleness: Duration,
    max_entries: usize,
}

impl<K: Eq + Hash + Clone, V: Clone> TxCache<K, V> {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            staleness: Duration::from_secs(config.staleness_secs),
            max_entries: config.max_entries,
        }
    }

    /// Return the cached value if it is at least as new as `latest_txid`.
    /// A stale entry is evicted on the spot.
    pub fn lookup(&self, key: &K, latest_txid: i64) -> Option<V> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        match entries.get_mut(key) {
            Some(entry) if entry.txid >= latest_txid => {
                entry.touched = Instant::now();
                Some(entry.value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Store a value computed as of `txid`. Last writer wins.
    pub fn insert(&self, key: K, txid: i64, value: V) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        // Amortized purge: bound memory without a timer thread.
        if entries.len() >= self.max_entries {
            let cutoff = Instant::now().checked_sub(self.staleness);
            entries.retain(|_, e| cutoff.is_none_or(|c| e.touched > c));
            if entries.len() >= self.max_entries {
                entries.clear();
            }
        }
        entries.insert(
            key,
            Entry {
                txid,
                value,
                touched: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, key: &K) {
        self.entries
            .lock()
            .expect("cache lock poisoned")
            .remove(key);
    }

    pub fn clear(&self) {
        self.entries.lock().expect("cache lock poisoned").clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_entries: usize) -> CacheConfig {
        CacheConfig {
            staleness_secs: 300,
            max_entries,
        }
    }

    #[test]
    fn test_hit_requires_current_txid() {
        let cache: TxCache<String, i32> = TxCache::new(&config(16));
        cache.insert("k".to_string(), 5, 42);

        assert_eq!(cache.lookup(&"k".to_string(), 5), Some(42));
        assert_eq!(cache.lookup(&"k".to_string(), 4), Some(42));
        // A newer relevant txid invalidates the entry.
        assert_eq!(cache.lookup(&"k".to_string(), 6), None);
        // And it was evicted, not just skipped.
        assert!(cache.is_empty());
    }

    #[test]
    fn test_last_writer_wins() {
        let cache: TxCache<String, i32> = TxCache::new(&config(16));
        cache.insert("k".to_string(), 5, 1);
        cache.insert("k".to_string(), 7, 2);
        assert_eq!(cache.lookup(&"k".to_string(), 7), Some(2));
    }

    #[test]
    fn test_invalidate() {
        let cache: TxCache<String, i32> = TxCache::new(&config(16));
        cache.insert("k".to_string(), 5, 1);
        cache.invalidate(&"k".to_string());
        assert_eq!(cache.lookup(&"k".to_string(), 1), None);
    }

    #[test]
    fn test_purge_bounds_entries() {
        let cache: TxCache<i32, i32> = TxCache::new(&config(4));
        for i in 0..32 {
            cache.insert(i, 1, i);
        }
        assert!(cache.len() <= 4);
    }
}
