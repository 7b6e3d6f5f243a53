//! Weighted, thread-safe cache used for open table readers and decoded
//! data blocks.
//!
//! Admission and eviction follow a small/main/ghost queue design: new
//! entries enter the `small` queue; entries re-referenced before eviction
//! graduate to `main`; keys evicted from `small` without reuse leave a
//! ghost trace so an early re-insert goes straight to `main`. Values are
//! reference-counted by the caller (`Arc`), so eviction only drops the
//! cache's reference; an evicted table file closes when its last reader
//! releases it.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::Mutex;

const MAX_FREQUENCY: u8 = 3;

struct CacheEntry<V> {
    value: V,
    weight: usize,
    freq: u8,
    in_main: bool,
}

struct Inner<K, V> {
    small: VecDeque<K>,
    main: VecDeque<K>,
    ghost: VecDeque<K>,
    entries: HashMap<K, CacheEntry<V>>,
    small_weight: usize,
    main_weight: usize,
}

pub struct Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    inner: Mutex<Inner<K, V>>,
    capacity: usize,
}

impl<K, V> Cache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// `capacity` is a weight budget: entry count for the table cache,
    /// bytes for the block cache.
    pub fn new(capacity: usize) -> Self {
        Cache {
            inner: Mutex::new(Inner {
                small: VecDeque::new(),
                main: VecDeque::new(),
                ghost: VecDeque::new(),
                entries: HashMap::new(),
                small_weight: 0,
                main_weight: 0,
            }),
            capacity: capacity.max(1),
        }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.inner.lock().unwrap();
        let entry = inner.entries.get_mut(key)?;
        entry.freq = (entry.freq + 1).min(MAX_FREQUENCY);
        Some(entry.value.clone())
    }

    pub fn insert(&self, key: K, value: V, weight: usize) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(old) = inner.entries.remove(&key) {
            if old.in_main {
                inner.main_weight -= old.weight;
                inner.main.retain(|k| k != &key);
            } else {
                inner.small_weight -= old.weight;
                inner.small.retain(|k| k != &key);
            }
        }
        let was_ghost = inner.ghost.contains(&key);
        if was_ghost {
            inner.ghost.retain(|k| k != &key);
        }
        let entry = CacheEntry { value, weight, freq: 0, in_main: was_ghost };
        if was_ghost {
            inner.main_weight += weight;
            inner.main.push_back(key.clone());
        } else {
            inner.small_weight += weight;
            inner.small.push_back(key.clone());
        }
        inner.entries.insert(key, entry);
        self.evict(&mut inner);
    }

    /// Drops an entry outright; used when the backing file is deleted.
    pub fn remove(&self, key: &K) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.remove(key) {
            if entry.in_main {
                inner.main_weight -= entry.weight;
                inner.main.retain(|k| k != key);
            } else {
                inner.small_weight -= entry.weight;
                inner.small.retain(|k| k != key);
            }
        }
        inner.ghost.retain(|k| k != key);
    }

    fn evict(&self, inner: &mut Inner<K, V>) {
        while inner.small_weight + inner.main_weight > self.capacity {
            // Favor the probationary queue until it shrinks to a tenth of
            // the budget, then rotate main.
            if inner.small_weight > self.capacity / 10 || inner.main.is_empty() {
                if !self.evict_small(inner) {
                    break;
                }
            } else if !self.evict_main(inner) {
                break;
            }
        }
    }

    fn evict_small(&self, inner: &mut Inner<K, V>) -> bool {
        while let Some(key) = inner.small.pop_front() {
            let entry = match inner.entries.get(&key) {
                Some(e) => e,
                None => continue,
            };
            if entry.freq > 1 {
                // Referenced while probationary: graduate.
                let weight = entry.weight;
                inner.entries.get_mut(&key).unwrap().in_main = true;
                inner.small_weight -= weight;
                inner.main_weight += weight;
                inner.main.push_back(key);
                continue;
            }
            let entry = inner.entries.remove(&key).unwrap();
            inner.small_weight -= entry.weight;
            inner.ghost.push_back(key);
            let ghost_limit = inner.entries.len() + 1;
            while inner.ghost.len() > ghost_limit {
                inner.ghost.pop_front();
            }
            return true;
        }
        false
    }

    fn evict_main(&self, inner: &mut Inner<K, V>) -> bool {
        let mut rotations = inner.main.len();
        while let Some(key) = inner.main.pop_front() {
            let entry = match inner.entries.get_mut(&key) {
                Some(e) => e,
                None => continue,
            };
            if entry.freq > 0 && rotations > 0 {
                entry.freq -= 1;
                rotations -= 1;
                inner.main.push_back(key);
                continue;
            }
            let entry = inner.entries.remove(&key).unwrap();
            inner.main_weight -= entry.weight;
            return true;
        }
        false
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_inserted() {
        let cache: Cache<u64, u64> = Cache::new(10);
        cache.insert(1, 100, 1);
        cache.insert(2, 200, 1);
        assert_eq!(cache.get(&1), Some(100));
        assert_eq!(cache.get(&2), Some(200));
        assert_eq!(cache.get(&3), None);
    }

    #[test]
    fn eviction_respects_capacity() {
        let cache: Cache<u64, u64> = Cache::new(4);
        for i in 0..20 {
            cache.insert(i, i, 1);
        }
        assert!(cache.len() <= 4);
        // The most recent insert survives.
        assert_eq!(cache.get(&19), Some(19));
    }

    #[test]
    fn hot_entries_survive_scans() {
        let cache: Cache<u64, u64> = Cache::new(8);
        cache.insert(1, 1, 1);
        for _ in 0..3 {
            cache.get(&1);
        }
        // A scan of cold keys should not push out the hot one.
        for i in 100..140 {
            cache.insert(i, i, 1);
        }
        assert_eq!(cache.get(&1), Some(1));
    }

    #[test]
    fn weights_count_toward_capacity() {
        let cache: Cache<u64, u64> = Cache::new(100);
        cache.insert(1, 1, 60);
        cache.insert(2, 2, 60);
        assert!(cache.len() < 2);
    }

    #[test]
    fn remove_drops_entry() {
        let cache: Cache<u64, u64> = Cache::new(10);
        cache.insert(1, 1, 1);
        cache.remove(&1);
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn reinsert_updates_value() {
        let cache: Cache<u64, u64> = Cache::new(10);
        cache.insert(1, 1, 1);
        cache.insert(1, 2, 1);
        assert_eq!(cache.get(&1), Some(2));
    }
}
