//! Concurrent map with per-entry expiry

use dashmap::DashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Entries expire lazily: an expired entry is removed by the `get` that
/// finds it, so [`TtlCache::len`] may count entries that already expired.
pub struct TtlCache<K, V> {
    entries: DashMap<K, (V, Instant)>,
    ttl: Duration,
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Insert or overwrite with a fresh deadline
    pub fn set(&self, key: K, value: V) {
        self.set_with_ttl(key, value, self.ttl);
    }

    pub fn set_with_ttl(&self, key: K, value: V, ttl: Duration) {
        self.entries.insert(key, (value, Instant::now() + ttl));
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let now = Instant::now();
        {
            let entry = self.entries.get(key)?;
            if entry.1 > now {
                return Some(entry.0.clone());
            }
        }
        self.entries.remove_if(key, |_, (_, expires_at)| *expires_at <= now);
        None
    }

    pub fn delete(&self, key: &K) {
        self.entries.remove(key);
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_set_delete() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.set("a", 1);
        cache.set("a", 2);
        cache.set("b", 3);

        assert_eq!(cache.get(&"a"), Some(2));
        assert_eq!(cache.len(), 2);

        cache.delete(&"a");
        assert_eq!(cache.get(&"a"), None);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_expiry_is_lazy() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.set_with_ttl("short", 1, Duration::from_millis(20));
        cache.set("long", 2);

        tokio::time::sleep(Duration::from_millis(40)).await;

        // still counted until looked up
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"short"), None);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&"long"), Some(2));
    }
}
