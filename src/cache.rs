//! Caching layer for frequently accessed node data
//!
//! Provides LRU caching for:
//! - Recent blocks, keyed by index (100 block limit)
//! - Relay routes back to message senders, keyed by bus address
use crate::blockchain::Block;
use lru::LruCache;
use parking_lot::Mutex;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Generic, thread-safe LRU cache.
pub struct ThreadSafeCache<K: Hash + Eq, V> {
    cache: Arc<Mutex<LruCache<K, V>>>,
}

impl<K, V> ThreadSafeCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Create a new LRU cache with specified capacity. A capacity of 0 is treated as 1.
    pub fn new_lru(capacity: usize) -> Self {
        let capacity_nz = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: Arc::new(Mutex::new(LruCache::new(capacity_nz))),
        }
    }

    /// Get a value without promoting it.
    pub fn peek(&self, key: &K) -> Option<V> {
        self.cache.lock().peek(key).cloned()
    }

    /// Get a value and mark it as recently used.
    pub fn get_promote(&self, key: &K) -> Option<V> {
        self.cache.lock().get(key).cloned()
    }

    pub fn insert(&self, key: K, value: V) {
        self.cache.lock().put(key, value);
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        self.cache.lock().pop(key)
    }

    pub fn len(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.cache.lock().cap().get()
    }
}

impl<K: Hash + Eq, V> Clone for ThreadSafeCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            cache: Arc::clone(&self.cache),
        }
    }
}

/// Cache for recent blocks
pub struct BlockCache {
    inner: ThreadSafeCache<u64, Block>,
}

impl BlockCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: ThreadSafeCache::new_lru(capacity),
        }
    }

    pub fn get(&self, index: u64) -> Option<Block> {
        self.inner.get_promote(&index)
    }

    pub fn put(&self, block: Block) {
        self.inner.insert(block.index, block);
    }

    /// Forgets one block, for example after it was cut off the chain.
    pub fn evict(&self, index: u64) {
        self.inner.remove(&index);
    }

    pub fn stats(&self) -> (usize, usize) {
        (self.inner.len(), self.inner.capacity())
    }
}

/// Cached relay routes: sender bus address -> ordered hops from this node to the sender.
pub type RouteCache = ThreadSafeCache<String, Vec<String>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_cache() {
        let cache = BlockCache::new(10);
        let block = Block::genesis(1_672_531_200_000);

        cache.put(block.clone());
        assert_eq!(cache.get(0), Some(block));
        assert_eq!(cache.stats(), (1, 10));

        cache.evict(0);
        assert!(cache.get(0).is_none());
        assert_eq!(cache.stats(), (0, 10));
    }

    #[test]
    fn test_route_cache_lru_eviction() {
        let cache = RouteCache::new_lru(2);
        cache.insert("a".to_string(), vec!["self".into(), "a".into()]);
        cache.insert("b".to_string(), vec!["self".into(), "b".into()]);

        // touch "a" so "b" becomes the eviction candidate
        assert!(cache.get_promote(&"a".to_string()).is_some());
        cache.insert("c".to_string(), vec!["self".into(), "c".into()]);

        assert_eq!(cache.len(), 2);
        assert!(cache.peek(&"b".to_string()).is_none());
        assert!(cache.peek(&"a".to_string()).is_some());
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let cache: ThreadSafeCache<u64, u64> = ThreadSafeCache::new_lru(0);
        assert_eq!(cache.capacity(), 1);
    }
}
