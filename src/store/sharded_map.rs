//! A fixed-bucket concurrent associative container with per-bucket locking
//! and an explicit two-phase-locking helper for cross-shard operations.
//!
//! Every mutator takes its caller-supplied callback *inside* the bucket
//! lock, so a persistence-log write can be interleaved with the in-memory
//! update atomically from the point of view of any other writer touching the
//! same bucket.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use parking_lot::Mutex;

/// One bucket: a mutex guarding an unordered vector of key/value pairs.
///
/// A `Vec` rather than a `HashMap` per bucket, matching the source's choice
/// of a linear per-bucket scan — buckets are small by construction (bucket
/// count is chosen so that load factor stays low) and this avoids a second
/// layer of hashing overhead per bucket.
struct Bucket<K, V> {
    entries: Mutex<Vec<(K, V)>>,
}

/// A sharded map over `B` fixed buckets, each independently lockable.
pub struct ShardedMap<K, V> {
    buckets: Vec<Bucket<K, V>>,
}

impl<K, V> ShardedMap<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Construct a map with `num_buckets` buckets. Bucket count is fixed for
    /// the lifetime of the map; there is no resizing.
    pub fn new(num_buckets: usize) -> Self {
        assert!(num_buckets > 0, "ShardedMap requires at least one bucket");
        let buckets = (0..num_buckets).map(|_| Bucket { entries: Mutex::new(Vec::new()) }).collect();
        Self { buckets }
    }

    fn bucket_index(&self, key: &K) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.buckets.len()
    }

    /// Insert `(key, value)` only if `key` is absent. `on_success` runs while
    /// the bucket lock is held, after the entry has been added. Returns
    /// `true` iff the insert happened.
    pub fn insert<F>(&self, key: K, value: V, on_success: F) -> bool
    where
        F: FnOnce(&K, &V),
    {
        let bucket = &self.buckets[self.bucket_index(&key)];
        let mut entries = bucket.entries.lock();
        if entries.iter().any(|(k, _)| k == &key) {
            return false;
        }
        entries.push((key.clone(), value.clone()));
        on_success(&key, &value);
        true
    }

    /// Insert `(key, value)` if absent, else replace the existing value.
    /// `on_insert`/`on_update` run while the bucket lock is held. Returns
    /// `true` iff the entry was newly inserted (as opposed to updated).
    pub fn upsert<FI, FU>(&self, key: K, value: V, on_insert: FI, on_update: FU) -> bool
    where
        FI: FnOnce(&K, &V),
        FU: FnOnce(&K, &V),
    {
        let bucket = &self.buckets[self.bucket_index(&key)];
        let mut entries = bucket.entries.lock();
        if let Some(slot) = entries.iter_mut().find(|(k, _)| k == &key) {
            slot.1 = value.clone();
            on_update(&key, &value);
            false
        } else {
            entries.push((key.clone(), value.clone()));
            on_insert(&key, &value);
            true
        }
    }

    /// Remove `key` if present. `on_success` runs while the bucket lock is
    /// held, after removal, and receives the removed value. Returns `true`
    /// iff something was removed.
    pub fn remove<F>(&self, key: &K, on_success: F) -> bool
    where
        F: FnOnce(&K, &V),
    {
        let bucket = &self.buckets[self.bucket_index(key)];
        let mut entries = bucket.entries.lock();
        if let Some(pos) = entries.iter().position(|(k, _)| k == key) {
            let (k, v) = entries.remove(pos);
            on_success(&k, &v);
            true
        } else {
            false
        }
    }

    /// Run `f` on the value for `key` under the bucket lock, returning
    /// whatever `f` returns, or `None` if `key` is absent.
    pub fn do_with<F, R>(&self, key: &K, f: F) -> Option<R>
    where
        F: FnOnce(&mut V) -> R,
    {
        let bucket = &self.buckets[self.bucket_index(key)];
        let mut entries = bucket.entries.lock();
        entries.iter_mut().find(|(k, _)| k == key).map(|(_, v)| f(v))
    }

    /// Read-only variant of [`ShardedMap::do_with`].
    pub fn do_with_readonly<F, R>(&self, key: &K, f: F) -> Option<R>
    where
        F: FnOnce(&V) -> R,
    {
        let bucket = &self.buckets[self.bucket_index(key)];
        let entries = bucket.entries.lock();
        entries.iter().find(|(k, _)| k == key).map(|(_, v)| f(v))
    }

    /// Two-phase locking over every bucket: acquire all bucket locks in
    /// ascending index order, call `per_entry` for every entry in the map,
    /// then call `finalizer` while every lock is still held (so the caller
    /// can perform a cross-shard-atomic action, such as writing a
    /// consistent snapshot), then release all locks.
    pub fn do_all_readonly<FE, FF>(&self, mut per_entry: FE, finalizer: FF)
    where
        FE: FnMut(&K, &V),
        FF: FnOnce(),
    {
        let guards: Vec<_> = self.buckets.iter().map(|b| b.entries.lock()).collect();
        for guard in &guards {
            for (k, v) in guard.iter() {
                per_entry(k, v);
            }
        }
        finalizer();
    }

    /// Two-phase locking over every bucket, removing every entry.
    pub fn clear(&self) {
        let mut guards: Vec<_> = self.buckets.iter().map(|b| b.entries.lock()).collect();
        for guard in &mut guards {
            guard.clear();
        }
    }

    /// Number of buckets (fixed at construction).
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Total number of entries across all buckets. Acquires every bucket
    /// lock; intended for diagnostics/tests, not hot paths.
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.entries.lock().len()).sum()
    }

    /// `true` iff the map has no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_duplicate_insert_fails() {
        let map: ShardedMap<String, i32> = ShardedMap::new(4);
        assert!(map.insert("a".to_string(), 1, |_, _| {}));
        assert!(!map.insert("a".to_string(), 2, |_, _| {}));
        assert_eq!(map.do_with_readonly(&"a".to_string(), |v| *v), Some(1));
    }

    #[test]
    fn upsert_inserts_then_updates() {
        let map: ShardedMap<String, i32> = ShardedMap::new(4);
        let inserted = map.upsert("k".to_string(), 1, |_, _| {}, |_, _| {});
        assert!(inserted);
        let inserted_again = map.upsert("k".to_string(), 2, |_, _| {}, |_, _| {});
        assert!(!inserted_again);
        assert_eq!(map.do_with_readonly(&"k".to_string(), |v| *v), Some(2));
    }

    #[test]
    fn remove_missing_key_returns_false() {
        let map: ShardedMap<String, i32> = ShardedMap::new(4);
        assert!(!map.remove(&"missing".to_string(), |_, _| {}));
    }

    #[test]
    fn do_all_readonly_visits_every_entry_across_buckets() {
        let map: ShardedMap<String, i32> = ShardedMap::new(8);
        for i in 0..20 {
            map.insert(format!("key{i}"), i, |_, _| {});
        }
        let mut seen = Vec::new();
        map.do_all_readonly(|k, v| seen.push((k.clone(), *v)), || {});
        assert_eq!(seen.len(), 20);
    }

    #[test]
    fn clear_empties_every_bucket() {
        let map: ShardedMap<String, i32> = ShardedMap::new(4);
        for i in 0..10 {
            map.insert(format!("k{i}"), i, |_, _| {});
        }
        assert_eq!(map.len(), 10);
        map.clear();
        assert!(map.is_empty());
    }

    #[test]
    fn callbacks_run_under_the_bucket_lock() {
        use std::sync::atomic::{AtomicBool, Ordering};
        let map: ShardedMap<String, i32> = ShardedMap::new(1);
        let ran = AtomicBool::new(false);
        map.insert("a".to_string(), 1, |_, _| {
            ran.store(true, Ordering::SeqCst);
            // Re-entrant lock attempts would deadlock here; reaching this
            // point at all proves the callback executed while held.
        });
        assert!(ran.load(Ordering::SeqCst));
    }
}
