//! Small TTL-expiring cache: replica location and peer info lookups are
//! both instances of the same cached-value-with-refresh idiom.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

struct Entry<V> {
    value: V,
    inserted_at: Instant,
}

pub struct ExpiringCache<K, V> {
    ttl: Duration,
    entries: Mutex<HashMap<K, Entry<V>>>,
}

impl<K: std::hash::Hash + Eq + Clone, V: Clone> ExpiringCache<K, V> {
    pub fn new(ttl: Duration) -> Self {
        ExpiringCache { ttl, entries: Mutex::new(HashMap::new()) }
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.lock();
        entries.get(key).and_then(|entry| {
            if entry.inserted_at.elapsed() < self.ttl {
                Some(entry.value.clone())
            } else {
                None
            }
        })
    }

    pub fn insert(&self, key: K, value: V) {
        self.entries.lock().insert(key, Entry { value, inserted_at: Instant::now() });
    }

    pub fn invalidate(&self, key: &K) {
        self.entries.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entry_expires_after_ttl() {
        let cache: ExpiringCache<u32, &'static str> = ExpiringCache::new(Duration::from_millis(10));
        cache.insert(1, "a");
        assert_eq!(cache.get(&1), Some("a"));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn invalidate_drops_entry_immediately() {
        let cache: ExpiringCache<u32, &'static str> = ExpiringCache::new(Duration::from_secs(60));
        cache.insert(1, "a");
        cache.invalidate(&1);
        assert_eq!(cache.get(&1), None);
    }
}
