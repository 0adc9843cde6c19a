pub mod key;
pub mod store;

pub use key::{entity_key, query_key};
pub use store::{CacheEntry, CacheStats, Lookup, TtlCache};

use std::collections::HashSet;
use std::time::Duration;

use crate::provider::{Page, Record};

/// Combined cache for the two payload shapes the gateway serves: paginated
/// query results and single records. Tag invalidation spans both stores.
#[derive(Clone)]
pub struct CacheManager {
    pub pages: TtlCache<Page<Record>>,
    pub records: TtlCache<Record>,
}

impl CacheManager {
    pub fn new(max_entries: usize) -> Self {
        Self {
            pages: TtlCache::new(max_entries),
            // single records are smaller and more numerous than pages
            records: TtlCache::new(max_entries),
        }
    }

    pub fn set_page(
        &self,
        key: String,
        page: Page<Record>,
        ttl: Duration,
        stale_window: Duration,
        tags: HashSet<String>,
    ) {
        self.pages.set(key, page, ttl, stale_window, tags);
    }

    pub fn set_record(
        &self,
        key: String,
        record: Record,
        ttl: Duration,
        stale_window: Duration,
        tags: HashSet<String>,
    ) {
        self.records.set(key, record, ttl, stale_window, tags);
    }

    /// Remove every entry carrying one of the tags, in both stores.
    pub fn invalidate_tags(&self, tags: &[String]) -> usize {
        self.pages.invalidate_tags(tags) + self.records.invalidate_tags(tags)
    }

    pub fn invalidate_keys(&self, keys: &[String]) -> usize {
        self.pages.invalidate(Some(keys), None) + self.records.invalidate(Some(keys), None)
    }

    pub fn sweep_expired(&self) -> (usize, usize) {
        (self.pages.sweep_expired(), self.records.sweep_expired())
    }

    pub fn stats(&self) -> CacheStats {
        self.pages.stats().merge(&self.records.stats())
    }

    pub fn clear_all(&self) {
        self.pages.clear();
        self.records.clear();
    }
}

impl Default for CacheManager {
    fn default() -> Self {
        Self::new(1000)
    }
}
