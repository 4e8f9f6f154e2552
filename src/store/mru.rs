//! Bounded most-recently-used key listing.

use std::collections::VecDeque;

use parking_lot::Mutex;

struct Inner {
    capacity: usize,
    entries: VecDeque<String>,
}

/// Thread-safe bounded MRU tracker: most-recently-touched key at the front,
/// duplicates removed on re-touch, oldest evicted once at capacity.
pub struct MruManager {
    inner: Mutex<Inner>,
}

impl MruManager {
    /// Construct a tracker holding at most `capacity` keys.
    pub fn new(capacity: usize) -> Self {
        Self { inner: Mutex::new(Inner { capacity, entries: VecDeque::new() }) }
    }

    /// Record that `key` was just touched: drop any existing occurrence,
    /// push it to the front, and evict the back entry if now over capacity.
    pub fn insert(&self, key: &str) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.entries.iter().position(|k| k == key) {
            inner.entries.remove(pos);
        }
        inner.entries.push_front(key.to_string());
        if inner.entries.len() > inner.capacity {
            inner.entries.pop_back();
        }
    }

    /// Remove every occurrence of `key`, if present.
    pub fn remove(&self, key: &str) {
        let mut inner = self.inner.lock();
        inner.entries.retain(|k| k != key);
    }

    /// Clear the entire listing.
    pub fn clear(&self) {
        self.inner.lock().entries.clear();
    }

    /// Newline-joined listing, most-recently-touched first.
    pub fn get(&self) -> String {
        let inner = self.inner.lock();
        inner.entries.iter().cloned().collect::<Vec<_>>().join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn most_recent_touch_is_first() {
        let mru = MruManager::new(3);
        mru.insert("a");
        mru.insert("b");
        mru.insert("c");
        assert_eq!(mru.get(), "c\nb\na");
    }

    #[test]
    fn re_touch_moves_to_front_without_duplicating() {
        let mru = MruManager::new(3);
        mru.insert("a");
        mru.insert("b");
        mru.insert("a");
        assert_eq!(mru.get(), "a\nb");
    }

    #[test]
    fn eviction_drops_oldest_once_over_capacity() {
        let mru = MruManager::new(2);
        mru.insert("a");
        mru.insert("b");
        mru.insert("c");
        assert_eq!(mru.get(), "c\nb");
    }

    #[test]
    fn remove_drops_the_key() {
        let mru = MruManager::new(3);
        mru.insert("a");
        mru.insert("b");
        mru.remove("a");
        assert_eq!(mru.get(), "b");
    }
}
