//! Record Cache
//!
//! Fixed-capacity map with strict least-recently-used eviction. An optional
//! hook runs whenever an entry leaves the cache (eviction or overwrite);
//! the entry's resources themselves are reclaimed by ownership.

use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;

/// Hook invoked with entries leaving the cache
pub type EvictFn<K, V> = Box<dyn Fn(&K, &V) + Send + Sync>;

/// Strict-LRU cache
pub struct LruCache<K, V> {
    capacity: usize,
    tick: u64,
    /// key -> (value, recency tick)
    map: HashMap<K, (V, u64)>,
    /// recency tick -> key, oldest first
    order: BTreeMap<u64, K>,
    on_evict: Option<EvictFn<K, V>>,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    /// A cache of `capacity` entries; 0 disables caching entirely
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            tick: 0,
            map: HashMap::new(),
            order: BTreeMap::new(),
            on_evict: None,
        }
    }

    pub fn with_evict_fn(capacity: usize, on_evict: EvictFn<K, V>) -> Self {
        let mut cache = Self::new(capacity);
        cache.on_evict = Some(on_evict);
        cache
    }

    /// Look up and mark most-recently used
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let tick = self.next_tick();
        match self.map.get_mut(key) {
            Some((_, recency)) => {
                self.order.remove(recency);
                *recency = tick;
                self.order.insert(tick, key.clone());
                self.map.get(key).map(|(value, _)| value)
            }
            None => None,
        }
    }

    /// Insert or overwrite; evicts the least-recently-used entry past
    /// capacity
    pub fn put(&mut self, key: K, value: V) {
        if self.capacity == 0 {
            return;
        }

        if let Some((old, recency)) = self.map.remove(&key) {
            self.order.remove(&recency);
            if let Some(hook) = &self.on_evict {
                hook(&key, &old);
            }
        }

        let tick = self.next_tick();
        self.map.insert(key.clone(), (value, tick));
        self.order.insert(tick, key);

        while self.map.len() > self.capacity {
            let Some((&oldest, _)) = self.order.iter().next() else {
                break;
            };
            let victim = self.order.remove(&oldest).and_then(|k| {
                self.map.remove(&k).map(|(v, _)| (k, v))
            });
            if let (Some((k, v)), Some(hook)) = (victim, &self.on_evict) {
                hook(&k, &v);
            }
        }
    }

    /// Drop an entry without invoking the hook's eviction semantics
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let (value, recency) = self.map.remove(key)?;
        self.order.remove(&recency);
        Some(value)
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }
}

// =============================================================================
// Tests
// =============================================================================
