//! End-to-end tests of the gateway composing cache, resilience, and a
//! counting in-memory backend.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use content_gateway::config::{ProviderConfig, ProviderKind};
use content_gateway::error::{Error, Result};
use content_gateway::provider::{MemoryProvider, Page, Provider, QueryOptions, Record};
use content_gateway::resilience::CircuitState;
use content_gateway::ContentGateway;

/// Delegates to a MemoryProvider while counting upstream calls, so tests
/// can assert how often the adapter was actually hit.
struct CountingProvider {
    inner: MemoryProvider,
    calls: AtomicU32,
}

impl CountingProvider {
    fn new(inner: MemoryProvider) -> Self {
        Self {
            inner,
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn tick(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl Provider for CountingProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Memory
    }

    async fn fetch_all(&self, collection: &str, options: &QueryOptions) -> Result<Page<Record>> {
        self.tick();
        self.inner.fetch_all(collection, options).await
    }

    async fn fetch_by_id(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        self.tick();
        self.inner.fetch_by_id(collection, id).await
    }

    async fn fetch_by_slug(&self, collection: &str, slug: &str) -> Result<Option<Record>> {
        self.tick();
        self.inner.fetch_by_slug(collection, slug).await
    }

    async fn create(&self, collection: &str, data: Value) -> Result<Record> {
        self.tick();
        self.inner.create(collection, data).await
    }

    async fn update(&self, collection: &str, id: &str, data: Value) -> Result<Record> {
        self.tick();
        self.inner.update(collection, id, data).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        self.tick();
        self.inner.delete(collection, id).await
    }

    async fn search(
        &self,
        collection: &str,
        query: &str,
        options: &QueryOptions,
    ) -> Result<Page<Record>> {
        self.tick();
        self.inner.search(collection, query, options).await
    }
}

/// A backend whose every call fails with a transient upstream error.
struct BrokenProvider {
    calls: AtomicU32,
}

impl BrokenProvider {
    fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn fail<T>(&self) -> Result<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(Error::Http("HTTP 503 for stations".into()))
    }
}

#[async_trait]
impl Provider for BrokenProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Memory
    }

    async fn fetch_all(&self, _: &str, _: &QueryOptions) -> Result<Page<Record>> {
        self.fail()
    }

    async fn fetch_by_id(&self, _: &str, _: &str) -> Result<Option<Record>> {
        self.fail()
    }

    async fn fetch_by_slug(&self, _: &str, _: &str) -> Result<Option<Record>> {
        self.fail()
    }

    async fn create(&self, _: &str, _: Value) -> Result<Record> {
        self.fail()
    }

    async fn update(&self, _: &str, _: &str, _: Value) -> Result<Record> {
        self.fail()
    }

    async fn delete(&self, _: &str, _: &str) -> Result<()> {
        self.fail()
    }

    async fn search(&self, _: &str, _: &str, _: &QueryOptions) -> Result<Page<Record>> {
        self.fail()
    }
}

fn station(id: &str, slug: &str, name: &str) -> Record {
    let mut fields = serde_json::Map::new();
    fields.insert("slug".into(), json!(slug));
    fields.insert("name".into(), json!(name));
    Record::new(id, fields)
}

fn test_config() -> ProviderConfig {
    let mut config = ProviderConfig::new(ProviderKind::Memory);
    config.retry_base_delay_ms = 1;
    config.retry_max_delay_ms = 5;
    config
}

fn seeded_memory() -> MemoryProvider {
    let memory = MemoryProvider::new();
    memory.seed("stations", station("s1", "kexp", "KEXP Seattle"));
    memory.seed("stations", station("s2", "fip", "FIP Paris"));
    memory
}

#[tokio::test]
async fn scenario_a_cold_cache_then_hit() {
    let provider = Arc::new(CountingProvider::new(seeded_memory()));
    let gateway = ContentGateway::with_provider(test_config(), provider.clone()).unwrap();

    let options = QueryOptions::page(1, 20);
    let first = gateway.fetch_all("stations", &options).await.unwrap();
    assert_eq!(first.total, 2);
    assert_eq!(provider.calls(), 1);

    let second = gateway.fetch_all("stations", &options).await.unwrap();
    assert_eq!(second.total, 2);
    assert_eq!(provider.calls(), 1, "second call must be served from cache");
    assert_eq!(gateway.cache_stats().hits, 1);
    assert_eq!(gateway.cache_stats().misses, 1);
}

#[tokio::test]
async fn scenario_b_stale_hit_triggers_background_refresh() {
    let memory = seeded_memory();
    let provider = Arc::new(CountingProvider::new(memory));

    let mut config = test_config();
    config.cache_ttl_secs = 2;
    config.stale_while_revalidate_secs = 1;
    let gateway = ContentGateway::with_provider(config, provider.clone()).unwrap();

    let options = QueryOptions::page(1, 20);
    let first = gateway.fetch_all("stations", &options).await.unwrap();
    assert_eq!(first.total, 2);
    assert_eq!(provider.calls(), 1);

    // grow the collection behind the cache's back
    provider
        .inner
        .seed("stations", station("s3", "nts", "NTS London"));

    // entry is fresh for ttl - stale_window = 1s
    tokio::time::sleep(Duration::from_millis(1200)).await;

    let stale = gateway.fetch_all("stations", &options).await.unwrap();
    assert_eq!(stale.total, 2, "stale value served synchronously");
    assert_eq!(gateway.cache_stats().stale_hits, 1);

    // let the fire-and-forget refresh land
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(provider.calls(), 2, "refresh made one background call");

    let refreshed = gateway.fetch_all("stations", &options).await.unwrap();
    assert_eq!(refreshed.total, 3, "fresh hit sees the updated value");
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn scenario_c_retries_then_breaker_opens() {
    let provider = Arc::new(BrokenProvider::new());

    let mut config = test_config();
    config.retry_attempts = 3;
    config.breaker_failure_threshold = 6;
    let gateway = ContentGateway::with_provider(config, provider.clone()).unwrap();

    let options = QueryOptions::page(1, 20);

    let err = gateway.fetch_all("stations", &options).await.unwrap_err();
    assert_eq!(provider.calls(), 3, "exactly retry_attempts invocations");
    assert!(err.is_transient());
    assert!(matches!(err, Error::RetriesExhausted { attempts: 3, .. }));

    // second failing call reaches the threshold on its last attempt
    let err = gateway.fetch_all("stations", &options).await.unwrap_err();
    assert_eq!(provider.calls(), 6);
    assert!(err.is_transient());
    assert_eq!(gateway.breaker("stations").state(), CircuitState::Open);

    // breaker now fails fast with zero adapter invocations
    let err = gateway.fetch_all("stations", &options).await.unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(provider.calls(), 6);
}

#[tokio::test]
async fn scenario_d_write_invalidates_collection() {
    let provider = Arc::new(CountingProvider::new(seeded_memory()));
    let gateway = ContentGateway::with_provider(test_config(), provider.clone()).unwrap();

    let options = QueryOptions::page(1, 20);
    let before = gateway.fetch_all("stations", &options).await.unwrap();
    assert_eq!(before.total, 2);
    assert_eq!(provider.calls(), 1);

    gateway
        .create("stations", json!({"slug": "nts", "name": "NTS London"}))
        .await
        .unwrap();
    assert_eq!(provider.calls(), 2);

    let after = gateway.fetch_all("stations", &options).await.unwrap();
    assert_eq!(after.total, 3, "post-write read must come from upstream");
    assert_eq!(provider.calls(), 3);
    assert_eq!(gateway.cache_stats().misses, 2);
}

#[tokio::test]
async fn record_reads_cache_and_missing_records_do_not() {
    let provider = Arc::new(CountingProvider::new(seeded_memory()));
    let gateway = ContentGateway::with_provider(test_config(), provider.clone()).unwrap();

    let record = gateway.fetch_by_id("stations", "s1").await.unwrap().unwrap();
    assert_eq!(record.slug.as_deref(), Some("kexp"));
    assert_eq!(provider.calls(), 1);

    gateway.fetch_by_id("stations", "s1").await.unwrap().unwrap();
    assert_eq!(provider.calls(), 1);

    // a missing record is None and is never cached
    assert!(gateway.fetch_by_id("stations", "zzz").await.unwrap().is_none());
    assert!(gateway.fetch_by_id("stations", "zzz").await.unwrap().is_none());
    assert_eq!(provider.calls(), 3);
}

#[tokio::test]
async fn slug_reads_use_their_own_cache_key() {
    let provider = Arc::new(CountingProvider::new(seeded_memory()));
    let gateway = ContentGateway::with_provider(test_config(), provider.clone()).unwrap();

    let by_slug = gateway
        .fetch_by_slug("stations", "fip")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(by_slug.id, "s2");

    let by_id = gateway.fetch_by_id("stations", "s2").await.unwrap().unwrap();
    assert_eq!(by_id.slug.as_deref(), Some("fip"));

    // distinct operations, distinct keys, one upstream call each
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn search_results_are_cached_per_query() {
    let provider = Arc::new(CountingProvider::new(seeded_memory()));
    let gateway = ContentGateway::with_provider(test_config(), provider.clone()).unwrap();

    let options = QueryOptions::page(1, 20);
    let hits = gateway.search("stations", "paris", &options).await.unwrap();
    assert_eq!(hits.total, 1);
    assert_eq!(provider.calls(), 1);

    gateway.search("stations", "paris", &options).await.unwrap();
    assert_eq!(provider.calls(), 1);

    gateway.search("stations", "seattle", &options).await.unwrap();
    assert_eq!(provider.calls(), 2, "different query, different key");
}

#[tokio::test]
async fn revalidate_drops_tagged_entries() {
    let provider = Arc::new(CountingProvider::new(seeded_memory()));
    let gateway = ContentGateway::with_provider(test_config(), provider.clone()).unwrap();

    let options = QueryOptions::page(1, 20);
    gateway.fetch_all("stations", &options).await.unwrap();
    gateway.fetch_by_id("stations", "s1").await.unwrap();
    assert_eq!(provider.calls(), 2);

    let removed = gateway.revalidate(&["stations".to_string()]);
    assert_eq!(removed, 2);

    gateway.fetch_all("stations", &options).await.unwrap();
    assert_eq!(provider.calls(), 3);
}

#[tokio::test]
async fn warm_many_populates_each_collection() {
    let memory = seeded_memory();
    memory.seed("shows", station("sh1", "late-night", "Late Night"));
    let provider = Arc::new(CountingProvider::new(memory));
    let gateway = ContentGateway::with_provider(test_config(), provider.clone()).unwrap();

    let collections = vec!["stations".to_string(), "shows".to_string()];
    let options = QueryOptions::page(1, 20);
    let results = gateway.warm_many(&collections, &options).await;

    assert_eq!(results.len(), 2);
    assert!(results.iter().all(|(_, result)| result.is_ok()));
    assert_eq!(provider.calls(), 2);

    // both collections now served from cache
    gateway.fetch_all("stations", &options).await.unwrap();
    gateway.fetch_all("shows", &options).await.unwrap();
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn invalid_query_fails_before_touching_upstream() {
    let provider = Arc::new(CountingProvider::new(seeded_memory()));
    let gateway = ContentGateway::with_provider(test_config(), provider.clone()).unwrap();

    let bad = QueryOptions {
        page: 0,
        ..Default::default()
    };
    let err = gateway.fetch_all("stations", &bad).await.unwrap_err();
    assert!(err.is_permanent());
    assert_eq!(provider.calls(), 0);
}

#[tokio::test]
async fn fallback_returns_empty_page_and_reports() {
    let provider = Arc::new(BrokenProvider::new());

    let mut config = test_config();
    config.retry_attempts = 1;
    let gateway = ContentGateway::with_provider(config, provider.clone()).unwrap();

    let observed = AtomicU32::new(0);
    let options = QueryOptions::page(1, 20);
    let page = gateway
        .fetch_all_or_empty("stations", &options, |_err| {
            observed.fetch_add(1, Ordering::SeqCst);
        })
        .await;

    assert!(page.is_empty());
    assert_eq!(page.page, 1);
    assert_eq!(observed.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn writes_respect_open_breaker() {
    let provider = Arc::new(BrokenProvider::new());

    let mut config = test_config();
    config.retry_attempts = 1;
    config.breaker_failure_threshold = 1;
    let gateway = ContentGateway::with_provider(config, provider.clone()).unwrap();

    let options = QueryOptions::page(1, 20);
    let _ = gateway.fetch_all("stations", &options).await;
    assert_eq!(gateway.breaker("stations").state(), CircuitState::Open);

    let err = gateway
        .create("stations", json!({"name": "WFMU"}))
        .await
        .unwrap_err();
    assert!(err.is_circuit_open());
    assert_eq!(provider.calls(), 1, "write never reached the upstream");
}

#[tokio::test]
async fn breaker_recovers_through_half_open_probe() {
    let provider = Arc::new(CountingProvider::new(seeded_memory()));

    let mut config = test_config();
    config.retry_attempts = 1;
    config.breaker_failure_threshold = 1;
    config.breaker_cool_down_secs = 1;
    let gateway = ContentGateway::with_provider(config, provider.clone()).unwrap();

    gateway.breaker("stations").force_open();
    let options = QueryOptions::page(1, 20);
    assert!(gateway
        .fetch_all("stations", &options)
        .await
        .unwrap_err()
        .is_circuit_open());

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let page = gateway.fetch_all("stations", &options).await.unwrap();
    assert_eq!(page.total, 2);
    assert_eq!(gateway.breaker("stations").state(), CircuitState::Closed);
}
