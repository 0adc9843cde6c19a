use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use lru::LruCache;
use parking_lot::RwLock;
use tracing::debug;

/// Three-way lookup result. `Stale` is servable but the caller should
/// trigger a background refresh; `Miss` means no usable entry exists.
#[derive(Debug, Clone, PartialEq)]
pub enum Lookup<T> {
    Hit(T),
    Stale(T),
    Miss,
}

impl<T> Lookup<T> {
    pub fn is_hit(&self) -> bool {
        matches!(self, Lookup::Hit(_))
    }

    pub fn is_stale(&self) -> bool {
        matches!(self, Lookup::Stale(_))
    }

    pub fn is_miss(&self) -> bool {
        matches!(self, Lookup::Miss)
    }

    /// The servable value, if any.
    pub fn into_value(self) -> Option<T> {
        match self {
            Lookup::Hit(value) | Lookup::Stale(value) => Some(value),
            Lookup::Miss => None,
        }
    }
}

/// Cache entry with freshness and staleness tracking.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub value: T,
    pub created_at: SystemTime,
    pub stale_at: SystemTime,
    pub expires_at: SystemTime,
    pub tags: HashSet<String>,
}

impl<T> CacheEntry<T> {
    pub fn new(value: T, ttl: Duration, stale_window: Duration, tags: HashSet<String>) -> Self {
        let now = SystemTime::now();
        // stale_at = now + (ttl - stale_window), clamped to >= now
        let fresh_for = ttl.saturating_sub(stale_window);
        Self {
            value,
            created_at: now,
            stale_at: now + fresh_for,
            expires_at: now + ttl,
            tags,
        }
    }

    pub fn is_expired(&self, now: SystemTime) -> bool {
        now >= self.expires_at
    }

    pub fn is_stale(&self, now: SystemTime) -> bool {
        now >= self.stale_at && now < self.expires_at
    }

    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.created_at)
            .unwrap_or_default()
    }
}

/// Cache statistics for monitoring. All counters are monotone; `size` is
/// the current entry count.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stale_hits: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub size: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.stale_hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits + self.stale_hits) as f64 / total as f64
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_stale_hit(&mut self) {
        self.stale_hits += 1;
    }

    pub fn record_eviction(&mut self) {
        self.evictions += 1;
    }

    pub fn record_expiration(&mut self) {
        self.expirations += 1;
    }

    pub fn merge(&self, other: &CacheStats) -> CacheStats {
        CacheStats {
            hits: self.hits + other.hits,
            misses: self.misses + other.misses,
            stale_hits: self.stale_hits + other.stale_hits,
            evictions: self.evictions + other.evictions,
            expirations: self.expirations + other.expirations,
            size: self.size + other.size,
        }
    }
}

struct StoreInner<T> {
    entries: LruCache<String, CacheEntry<T>>,
    // tag -> keys carrying it
    tags: HashMap<String, HashSet<String>>,
}

impl<T> StoreInner<T> {
    fn untag(&mut self, key: &str, entry_tags: &HashSet<String>) {
        for tag in entry_tags {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
    }

    fn remove_entry(&mut self, key: &str) -> Option<CacheEntry<T>> {
        let entry = self.entries.pop(key)?;
        let tags = entry.tags.clone();
        self.untag(key, &tags);
        Some(entry)
    }
}

/// TTL + stale-while-revalidate store with tag-based invalidation and LRU
/// eviction. An access on `get` counts as use, including stale hits.
#[derive(Clone)]
pub struct TtlCache<T: Clone> {
    store: Arc<RwLock<StoreInner<T>>>,
    stats: Arc<RwLock<CacheStats>>,
    capacity: usize,
}

impl<T: Clone> TtlCache<T> {
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1000).unwrap());

        Self {
            store: Arc::new(RwLock::new(StoreInner {
                entries: LruCache::new(cap),
                tags: HashMap::new(),
            })),
            stats: Arc::new(RwLock::new(CacheStats::default())),
            capacity: cap.get(),
        }
    }

    /// Three-way lookup. Expired entries are removed on sight.
    pub fn get(&self, key: &str) -> Lookup<T> {
        let mut store = self.store.write();
        let mut stats = self.stats.write();
        let now = SystemTime::now();

        let expired = match store.entries.get_mut(key) {
            Some(entry) if entry.is_expired(now) => true,
            Some(entry) => {
                let result = if entry.is_stale(now) {
                    stats.record_stale_hit();
                    Lookup::Stale(entry.value.clone())
                } else {
                    stats.record_hit();
                    Lookup::Hit(entry.value.clone())
                };
                return result;
            }
            None => {
                stats.record_miss();
                return Lookup::Miss;
            }
        };

        if expired {
            store.remove_entry(key);
            stats.record_expiration();
            stats.record_miss();
            stats.size = store.entries.len();
        }
        Lookup::Miss
    }

    /// Insert or overwrite. Expired entries are swept before capacity
    /// pressure triggers LRU eviction.
    pub fn set(
        &self,
        key: String,
        value: T,
        ttl: Duration,
        stale_window: Duration,
        tags: HashSet<String>,
    ) {
        let mut store = self.store.write();
        let mut stats = self.stats.write();

        // Replacement must not leave stale tag memberships behind
        if store.entries.contains(&key) {
            store.remove_entry(&key);
        }

        if store.entries.len() >= self.capacity {
            Self::sweep_expired_locked(&mut store, &mut stats);
        }

        while store.entries.len() >= self.capacity {
            if let Some((evicted_key, evicted)) = store.entries.pop_lru() {
                let evicted_tags = evicted.tags.clone();
                store.untag(&evicted_key, &evicted_tags);
                stats.record_eviction();
                debug!(key = %evicted_key, "evicted least-recently-used cache entry");
            } else {
                break;
            }
        }

        for tag in &tags {
            store
                .tags
                .entry(tag.clone())
                .or_insert_with(HashSet::new)
                .insert(key.clone());
        }

        let entry = CacheEntry::new(value, ttl, stale_window, tags);
        store.entries.push(key, entry);
        stats.size = store.entries.len();
    }

    /// Remove matching entries by explicit key and/or shared tag. Returns
    /// the number of entries removed.
    pub fn invalidate(&self, keys: Option<&[String]>, tags: Option<&[String]>) -> usize {
        let mut store = self.store.write();
        let mut stats = self.stats.write();

        let mut targets: HashSet<String> = HashSet::new();

        if let Some(keys) = keys {
            targets.extend(keys.iter().cloned());
        }

        if let Some(tags) = tags {
            for tag in tags {
                if let Some(tagged) = store.tags.get(tag) {
                    targets.extend(tagged.iter().cloned());
                }
            }
        }

        let mut removed = 0;
        for key in targets {
            if store.remove_entry(&key).is_some() {
                removed += 1;
            }
        }

        stats.size = store.entries.len();
        removed
    }

    pub fn invalidate_tags(&self, tags: &[String]) -> usize {
        self.invalidate(None, Some(tags))
    }

    /// Remove every entry past its expiry. Returns the number removed.
    pub fn sweep_expired(&self) -> usize {
        let mut store = self.store.write();
        let mut stats = self.stats.write();
        let count = Self::sweep_expired_locked(&mut store, &mut stats);
        stats.size = store.entries.len();
        count
    }

    fn sweep_expired_locked(store: &mut StoreInner<T>, stats: &mut CacheStats) -> usize {
        let now = SystemTime::now();
        let expired_keys: Vec<String> = store
            .entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        let count = expired_keys.len();
        for key in expired_keys {
            store.remove_entry(&key);
            stats.record_expiration();
        }
        count
    }

    pub fn stats(&self) -> CacheStats {
        let mut stats = self.stats.read().clone();
        stats.size = self.store.read().entries.len();
        stats
    }

    pub fn clear(&self) {
        let mut store = self.store.write();
        let mut stats = self.stats.write();

        store.entries.clear();
        store.tags.clear();
        stats.size = 0;
    }

    pub fn contains(&self, key: &str) -> bool {
        self.store.read().entries.contains(key)
    }

    pub fn len(&self) -> usize {
        self.store.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.read().entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current keys, most-recently-used first (for debugging/testing)
    pub fn keys(&self) -> Vec<String> {
        let store = self.store.read();
        store.entries.iter().map(|(k, _)| k.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    fn tagged(tags: &[&str]) -> HashSet<String> {
        tags.iter().map(|t| t.to_string()).collect()
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_never_inserted_key_misses() {
        let cache: TtlCache<String> = TtlCache::new(10);
        assert!(cache.get("absent").is_miss());
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn test_fresh_entry_hits() {
        let cache = TtlCache::new(10);
        cache.set("k".into(), 42u32, secs(60), secs(10), tagged(&["stations"]));

        assert_eq!(cache.get("k"), Lookup::Hit(42));
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 0);
        assert_eq!(stats.size, 1);
    }

    #[test]
    fn test_stale_window_returns_stale() {
        let cache = TtlCache::new(10);
        // fresh for ttl - stale_window = 0, servable until ttl
        cache.set(
            "k".into(),
            "v".to_string(),
            Duration::from_millis(200),
            Duration::from_millis(200),
            tagged(&[]),
        );

        let lookup = cache.get("k");
        assert!(lookup.is_stale());
        assert_eq!(lookup.into_value().as_deref(), Some("v"));
        assert_eq!(cache.stats().stale_hits, 1);
    }

    #[test]
    fn test_expired_entry_misses() {
        let cache = TtlCache::new(10);
        cache.set(
            "k".into(),
            1u8,
            Duration::from_millis(20),
            Duration::ZERO,
            tagged(&[]),
        );

        sleep(Duration::from_millis(40));

        assert!(cache.get("k").is_miss());
        let stats = cache.stats();
        assert_eq!(stats.expirations, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 0);
    }

    #[test]
    fn test_stale_window_clamped_to_now() {
        // stale_window larger than ttl clamps stale_at to insertion time
        let cache = TtlCache::new(10);
        cache.set(
            "k".into(),
            1u8,
            Duration::from_millis(100),
            Duration::from_secs(60),
            tagged(&[]),
        );
        assert!(cache.get("k").is_stale());
    }

    #[test]
    fn test_tag_invalidation_leaves_disjoint_entries() {
        let cache = TtlCache::new(10);
        cache.set("a".into(), 1u8, secs(60), secs(0), tagged(&["stations"]));
        cache.set("b".into(), 2u8, secs(60), secs(0), tagged(&["stations", "featured"]));
        cache.set("c".into(), 3u8, secs(60), secs(0), tagged(&["shows"]));

        let removed = cache.invalidate_tags(&["stations".to_string()]);
        assert_eq!(removed, 2);

        assert!(cache.get("a").is_miss());
        assert!(cache.get("b").is_miss());
        assert_eq!(cache.get("c"), Lookup::Hit(3));
    }

    #[test]
    fn test_invalidate_by_key() {
        let cache = TtlCache::new(10);
        cache.set("a".into(), 1u8, secs(60), secs(0), tagged(&[]));
        cache.set("b".into(), 2u8, secs(60), secs(0), tagged(&[]));

        let removed = cache.invalidate(Some(&["a".to_string()]), None);
        assert_eq!(removed, 1);
        assert!(cache.get("a").is_miss());
        assert!(cache.get("b").is_hit());
    }

    #[test]
    fn test_invalidate_empty_store_is_noop() {
        let cache: TtlCache<u8> = TtlCache::new(10);
        assert_eq!(cache.invalidate_tags(&["stations".to_string()]), 0);
    }

    #[test]
    fn test_lru_eviction_order() {
        let cache = TtlCache::new(2);
        cache.set("first".into(), 1u8, secs(60), secs(0), tagged(&[]));
        cache.set("second".into(), 2u8, secs(60), secs(0), tagged(&[]));

        // touch "first" so "second" becomes least recently used
        assert!(cache.get("first").is_hit());

        cache.set("third".into(), 3u8, secs(60), secs(0), tagged(&[]));

        assert_eq!(cache.len(), 2);
        assert!(cache.get("second").is_miss());
        assert!(cache.get("first").is_hit());
        assert!(cache.get("third").is_hit());
        assert_eq!(cache.stats().evictions, 1);
    }

    #[test]
    fn test_stale_hit_refreshes_recency() {
        let cache = TtlCache::new(2);
        cache.set(
            "stale-one".into(),
            1u8,
            Duration::from_millis(500),
            Duration::from_millis(500),
            tagged(&[]),
        );
        cache.set("fresh-two".into(), 2u8, secs(60), secs(0), tagged(&[]));

        // stale access still counts as use
        assert!(cache.get("stale-one").is_stale());

        cache.set("three".into(), 3u8, secs(60), secs(0), tagged(&[]));

        assert!(cache.contains("stale-one"));
        assert!(!cache.contains("fresh-two"));
    }

    #[test]
    fn test_expired_entries_swept_before_eviction() {
        let cache = TtlCache::new(2);
        cache.set(
            "doomed".into(),
            1u8,
            Duration::from_millis(20),
            Duration::ZERO,
            tagged(&[]),
        );
        cache.set("keeper".into(), 2u8, secs(60), secs(0), tagged(&[]));

        sleep(Duration::from_millis(40));

        // capacity pressure should claim the expired entry, not the live one
        cache.set("newcomer".into(), 3u8, secs(60), secs(0), tagged(&[]));

        assert!(cache.get("keeper").is_hit());
        assert!(cache.get("newcomer").is_hit());
        let stats = cache.stats();
        assert_eq!(stats.evictions, 0);
        assert_eq!(stats.expirations, 1);
    }

    #[test]
    fn test_overwrite_replaces_tags() {
        let cache = TtlCache::new(10);
        cache.set("k".into(), 1u8, secs(60), secs(0), tagged(&["old"]));
        cache.set("k".into(), 2u8, secs(60), secs(0), tagged(&["new"]));

        assert_eq!(cache.invalidate_tags(&["old".to_string()]), 0);
        assert_eq!(cache.get("k"), Lookup::Hit(2));
        assert_eq!(cache.invalidate_tags(&["new".to_string()]), 1);
    }

    #[test]
    fn test_sweep_expired() {
        let cache = TtlCache::new(10);
        cache.set(
            "a".into(),
            1u8,
            Duration::from_millis(10),
            Duration::ZERO,
            tagged(&["t"]),
        );
        cache.set("b".into(), 2u8, secs(60), secs(0), tagged(&["t"]));

        sleep(Duration::from_millis(30));

        assert_eq!(cache.sweep_expired(), 1);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("b").is_hit());
    }

    #[test]
    fn test_hit_rate() {
        let mut stats = CacheStats::default();
        assert_eq!(stats.hit_rate(), 0.0);

        stats.record_hit();
        stats.record_stale_hit();
        stats.record_miss();

        assert!((stats.hit_rate() - 2.0 / 3.0).abs() < f64::EPSILON);
    }
}
