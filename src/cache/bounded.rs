//! Capacity- and age-bounded map.
//!
//! Reads return `None` on a miss or on an entry older than `max_age` (which
//! is removed on the spot). Inserting a new key at capacity first evicts the
//! oldest-inserted entry. Keys pass through a pluggable normalizer.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::ConfigError;

/// Maps caller keys to storage keys.
pub type KeyNormalizer = Arc<dyn Fn(&str) -> String + Send + Sync>;

struct Slot<V> {
    value: V,
    created_at: Instant,
    /// Insertion order; renames count as a fresh insertion.
    sequence: u64,
}

pub struct BoundedCache<V> {
    entries: HashMap<String, Slot<V>>,
    capacity: usize,
    max_age: Option<Duration>,
    normalize: Option<KeyNormalizer>,
    next_sequence: u64,
}

impl<V> BoundedCache<V> {
    /// `max_age` of `None` means entries never age out. A capacity of zero is
    /// rejected: "no cache" is a separate switch.
    pub fn new(capacity: usize, max_age: Option<Duration>) -> Result<Self, ConfigError> {
        if capacity == 0 {
            return Err(ConfigError::ZeroCacheSize);
        }
        Ok(Self {
            entries: HashMap::with_capacity(capacity),
            capacity,
            max_age,
            normalize: None,
            next_sequence: 0,
        })
    }

    pub fn with_normalizer<F>(mut self, normalize: F) -> Self
    where
        F: Fn(&str) -> String + Send + Sync + 'static,
    {
        self.normalize = Some(Arc::new(normalize));
        self
    }

    pub fn get(&mut self, key: &str) -> Option<&V> {
        let key = self.storage_key(key);
        let usable = self.is_usable(self.entries.get(&key)?);
        if !usable {
            self.entries.remove(&key);
            return None;
        }
        self.entries.get(&key).map(|slot| &slot.value)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(&self.storage_key(key))
    }

    /// Inserts or replaces. Replacing an existing key never evicts.
    pub fn set(&mut self, key: &str, value: V) -> Option<V> {
        let key = self.storage_key(key);
        if !self.entries.contains_key(&key) {
            self.make_room();
        }
        let sequence = self.bump_sequence();
        self.entries
            .insert(key, Slot { value, created_at: Instant::now(), sequence })
            .map(|old| old.value)
    }

    pub fn remove(&mut self, key: &str) -> Option<V> {
        let key = self.storage_key(key);
        self.entries.remove(&key).map(|slot| slot.value)
    }

    /// Moves the entry at `old_key` to `new_key`, keeping its creation time.
    /// An entry already at `new_key` is replaced. Returns false if there was
    /// nothing to move.
    pub fn rename(&mut self, old_key: &str, new_key: &str) -> bool {
        let old_key = self.storage_key(old_key);
        let new_key = self.storage_key(new_key);
        if old_key == new_key {
            return self.entries.contains_key(&old_key);
        }
        let Some(mut slot) = self.entries.remove(&old_key) else {
            return false;
        };
        slot.sequence = self.bump_sequence();
        self.entries.insert(new_key, slot);
        true
    }

    /// Keeps entries for which `keep` returns true. Returns how many were removed.
    pub fn retain<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&str, &V) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|key, slot| keep(key, &slot.value));
        before - self.entries.len()
    }

    /// Evicts oldest-inserted entries until one more fits.
    pub fn make_room(&mut self) -> usize {
        let mut evicted = 0;
        while self.entries.len() >= self.capacity {
            let Some(oldest) = self.find_oldest_key() else { break };
            self.entries.remove(&oldest);
            evicted += 1;
        }
        evicted
    }

    /// Drops entries past `max_age`.
    pub fn cleanup(&mut self) -> usize {
        let Some(max_age) = self.max_age else { return 0 };
        let now = Instant::now();
        self.retain_slots(|slot| now.saturating_duration_since(slot.created_at) < max_age)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> {
        self.entries.iter().map(|(key, slot)| (key.as_str(), &slot.value))
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.entries.values().map(|slot| &slot.value)
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

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    fn storage_key(&self, key: &str) -> String {
        match &self.normalize {
            Some(normalize) => normalize(key),
            None => key.to_string(),
        }
    }

    fn is_usable(&self, slot: &Slot<V>) -> bool {
        self.max_age
            .map_or(true, |max_age| slot.created_at.elapsed() < max_age)
    }

    fn bump_sequence(&mut self) -> u64 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        sequence
    }

    fn find_oldest_key(&self) -> Option<String> {
        self.entries
            .iter()
            .min_by_key(|(_, slot)| slot.sequence)
            .map(|(key, _)| key.clone())
    }

    fn retain_slots<F>(&mut self, mut keep: F) -> usize
    where
        F: FnMut(&Slot<V>) -> bool,
    {
        let before = self.entries.len();
        self.entries.retain(|_, slot| keep(slot));
        before - self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_capacity_is_rejected() {
        assert_eq!(
            BoundedCache::<u32>::new(0, None).err(),
            Some(ConfigError::ZeroCacheSize)
        );
    }

    #[test]
    fn evicts_oldest_insert_at_capacity() {
        let mut cache = BoundedCache::new(2, None).unwrap();
        cache.set("a", 1);
        cache.set("b", 2);
        cache.set("c", 3);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("a").is_none());
        assert_eq!(cache.get("b"), Some(&2));
        assert_eq!(cache.get("c"), Some(&3));
    }

    #[test]
    fn replacing_a_key_does_not_evict() {
        let mut cache = BoundedCache::new(2, None).unwrap();
        cache.set("a", 1);
        cache.set("b", 2);
        assert_eq!(cache.set("a", 10), Some(1));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("b"), Some(&2));
    }

    #[test]
    fn rename_counts_as_fresh_insert() {
        let mut cache = BoundedCache::new(2, None).unwrap();
        cache.set("a", 1);
        cache.set("b", 2);
        assert!(cache.rename("a", "a2"));
        cache.set("c", 3);
        assert!(cache.get("b").is_none());
        assert_eq!(cache.get("a2"), Some(&1));
        assert!(!cache.rename("missing", "x"));
    }

    #[test]
    fn normalizer_folds_keys() {
        let mut cache = BoundedCache::new(4, None)
            .unwrap()
            .with_normalizer(|k| k.to_ascii_lowercase());
        cache.set("Accept", "text/html");
        assert_eq!(cache.get("ACCEPT"), Some(&"text/html"));
        assert!(cache.contains_key("accept"));
    }

    #[tokio::test(start_paused = true)]
    async fn aged_entries_miss_and_are_removed() {
        let mut cache = BoundedCache::new(4, Some(Duration::from_secs(10))).unwrap();
        cache.set("a", 1);
        tokio::time::advance(Duration::from_secs(9)).await;
        assert_eq!(cache.get("a"), Some(&1));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get("a").is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_drops_aged_entries() {
        let mut cache = BoundedCache::new(4, Some(Duration::from_secs(5))).unwrap();
        cache.set("old", 1);
        tokio::time::advance(Duration::from_secs(6)).await;
        cache.set("new", 2);
        assert_eq!(cache.cleanup(), 1);
        assert_eq!(cache.len(), 1);
    }
}
