//! Time-bounded memoization of finder results keyed by a query signature.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    inserted: Instant,
}

/// Hit/miss counters since construction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
}

/// TTL cache with a bound on the number of entries.
///
/// Expired entries are never returned. When the cache is full, expired entries are
/// purged first, then the oldest insertion is evicted. A poisoned lock turns the cache
/// into a pass-through rather than failing the query.
#[derive(Debug)]
pub struct QueryCache<V: Clone> {
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    ttl: Duration,
    max_entries: usize,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> QueryCache<V> {
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
            max_entries: max_entries.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn get(&self, signature: &str) -> Option<V> {
        let found = self.entries.read().ok().and_then(|guard| {
            guard
                .get(signature)
                .filter(|entry| entry.inserted.elapsed() < self.ttl)
                .map(|entry| entry.value.clone())
        });
        let counter = if found.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        found
    }

    pub fn insert(&self, signature: String, value: V) {
        let Ok(mut guard) = self.entries.write() else {
            return;
        };
        if !guard.contains_key(&signature) && guard.len() >= self.max_entries {
            let ttl = self.ttl;
            guard.retain(|_, entry| entry.inserted.elapsed() < ttl);
            if guard.len() >= self.max_entries {
                let oldest = guard
                    .iter()
                    .min_by_key(|(_, entry)| entry.inserted)
                    .map(|(key, _)| key.clone());
                if let Some(key) = oldest {
                    guard.remove(&key);
                }
            }
        }
        guard.insert(
            signature,
            CacheEntry {
                value,
                inserted: Instant::now(),
            },
        );
    }

    /// Number of stored entries, expired ones included until they are purged.
    pub fn len(&self) -> usize {
        self.entries.read().map(|guard| guard.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn get_returns_inserted_value() {
        let cache = QueryCache::new(Duration::from_secs(60), 8);
        assert_eq!(cache.get("find:a.*"), None);
        cache.insert("find:a.*".to_string(), vec![1, 2]);
        assert_eq!(cache.get("find:a.*"), Some(vec![1, 2]));
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1 });
    }

    #[test]
    fn expired_entries_are_not_returned() {
        let cache = QueryCache::new(Duration::from_millis(10), 8);
        cache.insert("k".to_string(), 1u32);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn evicts_oldest_when_full() {
        let cache = QueryCache::new(Duration::from_secs(60), 2);
        cache.insert("a".to_string(), 1u32);
        thread::sleep(Duration::from_millis(2));
        cache.insert("b".to_string(), 2);
        thread::sleep(Duration::from_millis(2));
        cache.insert("c".to_string(), 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.get("c"), Some(3));

        // Overwriting an existing key never evicts.
        cache.insert("b".to_string(), 20);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("c"), Some(3));
    }
}
