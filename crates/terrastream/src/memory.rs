//! Bounded in-memory tile cache with least-recently-used eviction.
//!
//! Entries are keyed by [`TileKey`] and hold every layer loaded for that key.
//! The bound counts keys, not layers: a key with three layers is one entry.

use std::collections::{BTreeMap, HashMap};

use crate::tile::TileKey;

#[derive(Debug)]
struct Entry<V> {
    layers: HashMap<String, V>,
    /// Last-touch stamp; also the key of this entry in `order`.
    stamp: u64,
}

/// LRU map from tile key to per-layer values.
#[derive(Debug)]
pub struct MemoryCache<V> {
    capacity: usize,
    entries: HashMap<TileKey, Entry<V>>,
    /// Touch stamps in ascending order; the first entry is the eviction victim.
    order: BTreeMap<u64, TileKey>,
    clock: u64,
}

impl<V> MemoryCache<V> {
    /// Create a cache holding at most `capacity` keys (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            entries: HashMap::new(),
            order: BTreeMap::new(),
            clock: 0,
        }
    }

    /// Maximum number of keys.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of keys currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether any layer is cached for `key`.
    #[must_use]
    pub fn contains_key(&self, key: &TileKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Look up a layer and mark the key as most recently used.
    pub fn get(&mut self, key: &TileKey, layer: &str) -> Option<&V> {
        if !self.entries.get(key)?.layers.contains_key(layer) {
            return None;
        }
        self.touch(key);
        self.entries.get(key)?.layers.get(layer)
    }

    /// Look up a layer without affecting eviction order.
    #[must_use]
    pub fn peek(&self, key: &TileKey, layer: &str) -> Option<&V> {
        self.entries.get(key)?.layers.get(layer)
    }

    /// All layers cached for `key`, without affecting eviction order.
    #[must_use]
    pub fn layers(&self, key: &TileKey) -> Option<&HashMap<String, V>> {
        self.entries.get(key).map(|entry| &entry.layers)
    }

    /// Mark `key` as most recently used. Returns whether it was present.
    pub fn touch(&mut self, key: &TileKey) -> bool {
        let stamp = self.next_stamp();
        let Some(entry) = self.entries.get_mut(key) else {
            return false;
        };
        self.order.remove(&entry.stamp);
        entry.stamp = stamp;
        self.order.insert(stamp, *key);
        true
    }

    /// Store a layer for `key`, mark the key most recently used, and evict
    /// least-recently-used keys until the bound holds.
    ///
    /// Returns the evicted keys, oldest first.
    pub fn insert(&mut self, key: TileKey, layer: impl Into<String>, value: V) -> Vec<TileKey> {
        if !self.touch(&key) {
            let stamp = self.next_stamp();
            self.entries.insert(
                key,
                Entry {
                    layers: HashMap::new(),
                    stamp,
                },
            );
            self.order.insert(stamp, key);
        }
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.layers.insert(layer.into(), value);
        }

        let mut evicted = Vec::new();
        while self.entries.len() > self.capacity {
            let Some((_, victim)) = self.order.pop_first() else {
                break;
            };
            self.entries.remove(&victim);
            evicted.push(victim);
        }
        evicted
    }

    /// Remove every layer of `key`.
    pub fn remove(&mut self, key: &TileKey) -> Option<HashMap<String, V>> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.stamp);
        Some(entry.layers)
    }

    /// Keys from least to most recently used.
    pub fn keys_by_recency(&self) -> impl Iterator<Item = &TileKey> {
        self.order.values()
    }

    fn next_stamp(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }
}
