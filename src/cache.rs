use std::{
    collections::{BTreeMap, HashMap},
    fmt::Debug,
    hash::Hash,
    sync::atomic::{AtomicUsize, Ordering},
    time::{Duration, Instant},
};

struct Entry<V> {
    value: V,
    /// Recency stamp; larger means more recently touched.
    tick: u64,
    last_access: Instant,
}

pub type EvictedFn<K, V> = Box<dyn Fn(K, V) + Send>;

pub type PinnedFn<V> = Box<dyn Fn(&V) -> bool + Send>;

/// Least-recently-used cache with a soft capacity.
///
/// Inserting past capacity evicts from the cold end, skipping entries the
/// pinned predicate reports as in use. When every candidate is pinned the
/// cache stays over capacity until a later insert finds something to evict.
/// Once an insert takes the cache past capacity, every unpinned entry idle
/// for longer than `idle_timeout` is reclaimed before anything else. Under
/// capacity nothing is evicted, however idle.
pub struct Cache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
{
    capacity: usize,
    idle_timeout: Duration,
    entries: HashMap<K, Entry<V>>,
    /// tick -> key, oldest first.
    order: BTreeMap<u64, K>,
    next_tick: u64,
    evicted_fn: Option<EvictedFn<K, V>>,
    pinned_fn: Option<PinnedFn<V>>,
    stats: Stats,
}

impl<K, V> Cache<K, V>
where
    K: PartialEq + Eq + Hash + Clone + Debug,
{
    pub fn new(capacity: usize, idle_timeout: Duration, evicted_fn: Option<EvictedFn<K, V>>) -> Self {
        Cache {
            capacity,
            idle_timeout,
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_tick: 0,
            evicted_fn,
            pinned_fn: None,
            stats: Stats::new(),
        }
    }

    /// Entries for which `pinned` returns true are never evicted.
    pub fn with_pinned_fn(mut self, pinned: PinnedFn<V>) -> Self {
        self.pinned_fn = Some(pinned);
        self
    }

    /// Returns the value for `key` and marks it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        let tick = self.bump();
        match self.entries.get_mut(key) {
            Some(entry) => {
                self.order.remove(&entry.tick);
                self.order.insert(tick, key.clone());
                entry.tick = tick;
                entry.last_access = Instant::now();
                self.stats.hit();
                Some(&entry.value)
            }
            None => {
                self.stats.miss();
                None
            }
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    /// Inserts `value` as the most recently used entry. Past capacity, idle
    /// entries are evicted and the rest trimmed back toward capacity. Replacing an existing key
    /// hands the old value to the eviction callback.
    pub fn insert(&mut self, key: K, value: V) {
        let tick = self.bump();
        let entry = Entry {
            value,
            tick,
            last_access: Instant::now(),
        };

        if let Some(old) = self.entries.insert(key.clone(), entry) {
            self.order.remove(&old.tick);
            self.notify(key.clone(), old.value);
        }
        self.order.insert(tick, key.clone());

        if self.entries.len() > self.capacity {
            self.evict_idle(&key);
            self.evict_over_capacity(&key);
        }
    }

    /// Removes `key` without calling the eviction callback.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let entry = self.entries.remove(key)?;
        self.order.remove(&entry.tick);
        Some(entry.value)
    }

    /// Removes every entry, passing each to the eviction callback.
    pub fn clear(&mut self) {
        let keys: Vec<K> = self.order.values().cloned().collect();
        for key in keys {
            if let Some(value) = self.remove(&key) {
                self.notify(key, value);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> (usize, usize) {
        self.stats.get()
    }

    fn bump(&mut self) -> u64 {
        self.next_tick += 1;
        self.next_tick
    }

    fn is_pinned(&self, value: &V) -> bool {
        self.pinned_fn.as_ref().is_some_and(|pinned| pinned(value))
    }

    fn notify(&self, key: K, value: V) {
        if let Some(evicted_fn) = &self.evicted_fn {
            evicted_fn(key, value);
        }
    }

    /// Evicts every unpinned entry idle for longer than the timeout, except
    /// `keep`.
    fn evict_idle(&mut self, keep: &K) {
        let now = Instant::now();
        let idle: Vec<K> = self
            .order
            .values()
            .filter(|key| *key != keep)
            .filter(|key| {
                self.entries.get(*key).is_some_and(|entry| {
                    now.duration_since(entry.last_access) > self.idle_timeout
                        && !self.is_pinned(&entry.value)
                })
            })
            .cloned()
            .collect();

        for key in idle {
            if let Some(value) = self.remove(&key) {
                tracing::debug!(key = ?key, "Evicting idle cache entry");
                self.notify(key, value);
            }
        }
    }

    /// Evicts least recently used unpinned entries until the cache is back
    /// at capacity, never touching `keep`.
    fn evict_over_capacity(&mut self, keep: &K) {
        if self.entries.len() <= self.capacity {
            return;
        }

        let excess = self.entries.len() - self.capacity;
        let victims: Vec<K> = self
            .order
            .values()
            .filter(|key| *key != keep)
            .filter(|key| {
                self.entries
                    .get(*key)
                    .is_some_and(|entry| !self.is_pinned(&entry.value))
            })
            .take(excess)
            .cloned()
            .collect();

        if victims.len() < excess {
            tracing::debug!(
                len = self.entries.len(),
                capacity = self.capacity,
                "Cache over capacity; remaining entries are pinned"
            );
        }

        for key in victims {
            if let Some(value) = self.remove(&key) {
                self.notify(key, value);
            }
        }
    }
}

struct Stats {
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl Stats {
    fn new() -> Self {
        Stats {
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn get(&self) -> (usize, usize) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
