use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use lru::LruCache;
use parking_lot::Mutex;
use crate::core::dn::Dn;
use crate::core::entry::Entry;
use crate::core::types::EntryID;

/// Shared cache of decoded entries, consulted before id2entry
pub trait EntryCache: Send + Sync {
    fn get(&self, id: EntryID) -> Option<Entry>;

    fn get_id(&self, dn: &Dn) -> Option<EntryID>;

    fn put(&self, id: EntryID, entry: &Entry);

    fn remove(&self, id: EntryID);

    fn clear(&self);

    fn stats(&self) -> CacheStats;
}

struct CacheState {
    entries: LruCache<EntryID, Entry>,
    ids: HashMap<Dn, EntryID>,
}

/// LRU entry cache with a DN side map
pub struct LruEntryCache {
    state: Mutex<CacheState>,
    capacity: usize,
    hit_count: AtomicUsize,
    miss_count: AtomicUsize,
}

impl LruEntryCache {
    /// `None` when `capacity` is zero, which disables caching
    pub fn new(capacity: usize) -> Option<Self> {
        let cap = NonZeroUsize::new(capacity)?;
        Some(LruEntryCache {
            state: Mutex::new(CacheState {
                entries: LruCache::new(cap),
                ids: HashMap::new(),
            }),
            capacity,
            hit_count: AtomicUsize::new(0),
            miss_count: AtomicUsize::new(0),
        })
    }
}

impl EntryCache for LruEntryCache {
    fn get(&self, id: EntryID) -> Option<Entry> {
        let mut state = self.state.lock();
        match state.entries.get(&id) {
            Some(entry) => {
                self.hit_count.fetch_add(1, Ordering::Relaxed);
                Some(entry.clone())
            }
            None => {
                self.miss_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn get_id(&self, dn: &Dn) -> Option<EntryID> {
        self.state.lock().ids.get(dn).copied()
    }

    fn put(&self, id: EntryID, entry: &Entry) {
        let mut state = self.state.lock();
        if let Some((evicted_id, evicted)) = state.entries.push(id, entry.clone()) {
            if evicted_id != id || evicted.dn != entry.dn {
                state.ids.remove(&evicted.dn);
            }
        }
        state.ids.insert(entry.dn.clone(), id);
    }

    fn remove(&self, id: EntryID) {
        let mut state = self.state.lock();
        if let Some(entry) = state.entries.pop(&id) {
            state.ids.remove(&entry.dn);
        }
    }

    fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.ids.clear();
    }

    fn stats(&self) -> CacheStats {
        CacheStats {
            hit_count: self.hit_count.load(Ordering::Relaxed),
            miss_count: self.miss_count.load(Ordering::Relaxed),
            size: self.state.lock().entries.len(),
            capacity: self.capacity,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheStats {
    pub hit_count: usize,
    pub miss_count: usize,
    pub size: usize,
    pub capacity: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hit_count + self.miss_count;
        if total == 0 {
            0.0
        } else {
            self.hit_count as f64 / total as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(dn: &str) -> Entry {
        Entry::new(Dn::parse(dn).unwrap())
    }

    #[test]
    fn eviction_drops_dn_mapping() {
        let cache = LruEntryCache::new(2).unwrap();
        cache.put(EntryID(1), &entry("cn=a,o=x"));
        cache.put(EntryID(2), &entry("cn=b,o=x"));
        cache.put(EntryID(3), &entry("cn=c,o=x"));

        assert!(cache.get(EntryID(1)).is_none());
        assert!(cache.get_id(&Dn::parse("cn=a,o=x").unwrap()).is_none());
        assert_eq!(cache.get_id(&Dn::parse("CN=C,o=x").unwrap()), Some(EntryID(3)));

        cache.remove(EntryID(3));
        assert!(cache.get_id(&Dn::parse("cn=c,o=x").unwrap()).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hit_count, 0);
        assert_eq!(stats.miss_count, 1);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn zero_capacity_disables_cache() {
        assert!(LruEntryCache::new(0).is_none());
    }
}
