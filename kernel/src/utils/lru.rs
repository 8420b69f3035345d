//! Bounded least-recently-used cache.
//!
//! Values are handed out as `Arc`s; an entry is only evictable while the
//! cache holds the sole reference. Insertion may briefly push the cache one
//! item over its bound — [`purge_excess`](LruCache::purge_excess) brings it
//! back, invoking the caller's write-back for each victim first.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;

pub struct LruCache<K: Ord + Copy, V> {
    counter: u64,
    max_items: usize,
    items: BTreeMap<K, Item<V>>,
}

struct Item<V> {
    last_use: u64,
    value: Arc<V>,
}

impl<K: Ord + Copy, V> LruCache<K, V> {
    pub fn new(max_items: usize) -> Self {
        Self {
            counter: 0,
            max_items,
            items: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Insert `value` unless `key` is already present. Returns whether the
    /// insertion took place.
    pub fn insert(&mut self, key: K, value: Arc<V>) -> bool {
        if self.items.contains_key(&key) {
            return false;
        }
        let stamp = self.counter;
        self.items.insert(
            key,
            Item {
                last_use: stamp,
                value,
            },
        );
        true
    }

    /// Look up `key`, marking it most recently used.
    pub fn find(&mut self, key: &K) -> Option<Arc<V>> {
        self.counter += 1;
        let counter = self.counter;
        self.items.get_mut(key).map(|item| {
            item.last_use = counter;
            item.value.clone()
        })
    }

    /// Evict least-recently-used unreferenced entries until the cache is
    /// within its bound, calling `write_back` on each victim before it is
    /// dropped.
    ///
    /// An entry whose refcount rises between selection and removal is put
    /// back untouched.
    pub fn purge_excess(&mut self, mut write_back: impl FnMut(K, &V)) {
        while self.items.len() > self.max_items {
            let victim = self
                .items
                .iter()
                .filter(|(_, item)| Arc::strong_count(&item.value) == 1)
                .min_by_key(|(_, item)| item.last_use)
                .map(|(key, _)| *key);

            let Some(key) = victim else {
                log::warn!("lru: no unreferenced entry to purge");
                return;
            };

            let item = self.items.remove(&key).expect("victim vanished");
            if Arc::strong_count(&item.value) != 1 {
                log::warn!("lru: reference appeared while purging; reinserting");
                self.items.insert(key, item);
                continue;
            }
            write_back(key, &item.value);
        }
    }

    /// Drain every entry, calling `write_back` on each.
    pub fn flush_all(&mut self, mut write_back: impl FnMut(K, &V)) {
        for (key, item) in self.items.iter() {
            write_back(*key, &item.value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eviction_order_is_lru() {
        let mut cache: LruCache<u32, u32> = LruCache::new(2);
        assert!(cache.insert(1, Arc::new(10)));
        assert!(cache.insert(2, Arc::new(20)));
        // Touch 1 so that 2 becomes the eviction candidate.
        assert_eq!(*cache.find(&1).unwrap(), 10);
        assert!(cache.insert(3, Arc::new(30)));
        assert_eq!(cache.len(), 3);

        let mut evicted = alloc::vec::Vec::new();
        cache.purge_excess(|k, _| evicted.push(k));
        assert_eq!(evicted, [2]);
        assert_eq!(cache.len(), 2);
        assert!(cache.find(&2).is_none());
    }

    #[test]
    fn referenced_entries_survive() {
        let mut cache: LruCache<u32, u32> = LruCache::new(1);
        let held = Arc::new(10);
        cache.insert(1, held.clone());
        cache.insert(2, Arc::new(20));

        let mut evicted = alloc::vec::Vec::new();
        cache.purge_excess(|k, _| evicted.push(k));
        // Entry 1 is pinned by `held`, so 2 goes instead.
        assert_eq!(evicted, [2]);
        assert!(cache.find(&1).is_some());
        drop(held);
    }

    #[test]
    fn duplicate_insert_rejected() {
        let mut cache: LruCache<u32, u32> = LruCache::new(4);
        assert!(cache.insert(1, Arc::new(1)));
        assert!(!cache.insert(1, Arc::new(2)));
        assert_eq!(*cache.find(&1).unwrap(), 1);
    }

    #[test]
    fn bound_overshoots_by_at_most_one() {
        let mut cache: LruCache<u32, u32> = LruCache::new(3);
        for i in 0..16 {
            cache.insert(i, Arc::new(i));
            assert!(cache.len() <= 3 + 1);
            cache.purge_excess(|_, _| {});
            assert!(cache.len() <= 3);
        }
    }
}
