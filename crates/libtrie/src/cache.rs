//! Memoizing decorator over a [`TrieHandle`].
//!
//! Caches decoded results per key, including misses, so repeated queries
//! skip traversal and allocation. Entries never outlive the handle: the
//! cache is emptied on close and whenever the handle is found released.

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

use crate::error::LookupFault;
use crate::handle::{TrieHandle, released};
use crate::values::Values;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CacheConfig {
    /// Maximum number of keys kept before least-recently-used eviction.
    pub capacity: NonZeroUsize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            capacity: NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

impl CacheConfig {
    pub fn with_capacity(capacity: usize) -> Self {
        CacheConfig {
            capacity: NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

pub struct CachedTrie {
    handle: TrieHandle,
    // `None` caches a miss, `Some(empty)` a keys-only hit.
    entries: Mutex<LruCache<String, Option<Values>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl CachedTrie {
    pub fn new(handle: TrieHandle, config: CacheConfig) -> Self {
        CachedTrie {
            handle,
            entries: Mutex::new(LruCache::new(config.capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn handle(&self) -> &TrieHandle {
        &self.handle
    }

    pub fn get(&self, key: &str) -> Result<Option<Values>, LookupFault> {
        // Held across the cache access so the handle cannot be released
        // between the liveness check and serving a cached entry.
        let guard = self.handle.read();
        let Some(trie) = guard.as_ref() else {
            self.entries.lock().clear();
            return Err(released());
        };

        if let Some(cached) = self.entries.lock().get(key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(cached.clone());
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        let found = trie.get(key)?;
        self.entries.lock().put(key.to_owned(), found.clone());
        Ok(found)
    }

    pub fn lookup(&self, key: &str) -> Result<Values, LookupFault> {
        Ok(self.get(key)?.unwrap_or_default())
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.lock().len(),
        }
    }

    /// Drop every cached entry and release the underlying handle.
    pub fn close(self) -> bool {
        let stats = self.stats();
        self.entries.lock().clear();
        debug!(hits = stats.hits, misses = stats.misses, "trie cache closed");
        self.handle.close()
    }
}

#[cfg(test)]
mod tests {
    use super::{CacheConfig, CachedTrie};
    use crate::builder::{BuilderOptions, TrieBuilder};
    use crate::error::LookupFault;
    use crate::handle::TrieHandle;
    use crate::trie::Trie;

    fn cached(builder: &TrieBuilder, capacity: usize) -> CachedTrie {
        let trie = Trie::from_vec(builder.to_bytes().expect("serializes")).expect("loads");
        CachedTrie::new(TrieHandle::new(trie), CacheConfig::with_capacity(capacity))
    }

    fn animals() -> TrieBuilder {
        let mut builder = TrieBuilder::default();
        builder.insert("cat", "feline");
        builder.insert("cat", "pet");
        builder.insert("car", "vehicle");
        builder
    }

    #[test]
    fn repeated_lookups_hit_the_cache() -> Result<(), LookupFault> {
        let cache = cached(&animals(), 8);
        assert_eq!(cache.lookup("cat")?, ["feline", "pet"]);
        assert_eq!(cache.lookup("cat")?, ["feline", "pet"]);
        assert_eq!(cache.lookup("cat")?, ["feline", "pet"]);

        let stats = cache.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.entries, 1);
        Ok(())
    }

    #[test]
    fn misses_are_cached_as_misses() -> Result<(), LookupFault> {
        let cache = cached(&animals(), 8);
        assert_eq!(cache.get("ca")?, None);
        assert_eq!(cache.get("ca")?, None);
        assert!(cache.lookup("care")?.is_empty());
        assert_eq!(cache.stats().hits, 1);
        Ok(())
    }

    #[test]
    fn keys_only_hit_stays_distinct_from_miss() -> Result<(), LookupFault> {
        let mut builder = TrieBuilder::new(BuilderOptions {
            keys_only: true,
            ..BuilderOptions::default()
        });
        builder.insert_key("present");
        let cache = cached(&builder, 8);

        for _ in 0..2 {
            assert_eq!(cache.get("present")?.map(|v| v.len()), Some(0));
            assert_eq!(cache.get("absent")?, None);
        }
        assert_eq!(cache.stats().hits, 2);
        Ok(())
    }

    #[test]
    fn capacity_bounds_entries() -> Result<(), LookupFault> {
        let cache = cached(&animals(), 2);
        cache.lookup("cat")?;
        cache.lookup("car")?;
        cache.lookup("dog")?;
        assert_eq!(cache.stats().entries, 2);

        // "cat" was evicted first.
        cache.lookup("cat")?;
        assert_eq!(cache.stats().hits, 0);
        Ok(())
    }

    #[test]
    fn released_handle_empties_cache() -> Result<(), LookupFault> {
        let cache = cached(&animals(), 8);
        cache.lookup("cat")?;
        assert_eq!(cache.stats().entries, 1);

        assert!(cache.handle().clone().close());
        assert_eq!(cache.lookup("cat"), Err(LookupFault::Released));
        assert_eq!(cache.stats().entries, 0);
        Ok(())
    }

    #[test]
    fn close_releases_shared_handle() -> Result<(), LookupFault> {
        let cache = cached(&animals(), 8);
        let other = cache.handle().clone();
        cache.lookup("car")?;
        assert!(cache.close());
        assert!(other.is_released());
        assert_eq!(other.lookup("car"), Err(LookupFault::Released));
        Ok(())
    }

    #[test]
    fn zero_capacity_falls_back_to_one() {
        assert_eq!(CacheConfig::with_capacity(0).capacity.get(), 1);
    }
}
