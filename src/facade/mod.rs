use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashSet;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::{entity_key, query_key, CacheManager, CacheStats, Lookup};
use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{Error, Result};
use crate::provider::{self, Page, Provider, QueryOptions, Record};
use crate::resilience::{with_fallback, CircuitBreaker, Resilience, RetryPolicy};

#[derive(Debug, Clone)]
enum PageOp {
    FetchAll,
    Search(String),
}

impl PageOp {
    fn name(&self) -> &'static str {
        match self {
            PageOp::FetchAll => "fetch_all",
            PageOp::Search(_) => "search",
        }
    }
}

#[derive(Debug, Clone)]
enum RecordOp {
    ById(String),
    BySlug(String),
}

impl RecordOp {
    fn name(&self) -> &'static str {
        match self {
            RecordOp::ById(_) => "fetch_by_id",
            RecordOp::BySlug(_) => "fetch_by_slug",
        }
    }

    fn ident(&self) -> &str {
        match self {
            RecordOp::ById(ident) | RecordOp::BySlug(ident) => ident,
        }
    }
}

/// The content-access facade. Owns one configured adapter and composes it
/// with the cache manager and resilience controller; every read goes
/// cache-first, every write invalidates the collection's tagged entries.
pub struct ContentGateway {
    provider: Arc<dyn Provider>,
    cache: CacheManager,
    resilience: Arc<Resilience>,
    read_policy: RetryPolicy,
    write_policy: RetryPolicy,
    config: ProviderConfig,
    refreshing: Arc<DashSet<String>>,
}

impl ContentGateway {
    /// Validate the config once and build the adapter it selects.
    pub fn from_config(config: ProviderConfig) -> Result<Self> {
        config.validate()?;
        let provider = provider::build(&config)?;
        Self::with_provider(config, provider)
    }

    /// Compose the gateway around an already-built adapter. Useful for
    /// tests and for backends constructed out-of-band.
    pub fn with_provider(config: ProviderConfig, provider: Arc<dyn Provider>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            cache: CacheManager::new(config.cache_max_entries),
            resilience: Arc::new(Resilience::from_config(&config)),
            read_policy: RetryPolicy::from_config(&config),
            write_policy: RetryPolicy::for_writes(&config),
            provider,
            config,
            refreshing: Arc::new(DashSet::new()),
        })
    }

    pub fn provider_kind(&self) -> ProviderKind {
        self.provider.kind()
    }

    pub fn config(&self) -> &ProviderConfig {
        &self.config
    }

    /// Paginated listing, cache-first with stale-while-revalidate.
    pub async fn fetch_all(&self, collection: &str, options: &QueryOptions) -> Result<Page<Record>> {
        self.fetch_page(collection, options, PageOp::FetchAll).await
    }

    /// Full-text search, cached under its own operation key.
    pub async fn search(
        &self,
        collection: &str,
        query: &str,
        options: &QueryOptions,
    ) -> Result<Page<Record>> {
        self.fetch_page(collection, options, PageOp::Search(query.to_string()))
            .await
    }

    async fn fetch_page(
        &self,
        collection: &str,
        options: &QueryOptions,
        op: PageOp,
    ) -> Result<Page<Record>> {
        options.validate()?;

        let key = self.page_key(collection, options, &op);
        match self.cache.pages.get(&key) {
            Lookup::Hit(page) => Ok(page),
            Lookup::Stale(page) => {
                self.spawn_page_refresh(key, collection.to_string(), options.clone(), op);
                Ok(page)
            }
            Lookup::Miss => {
                let page = self.page_upstream(collection, options, &op).await?;
                self.store_page(key, collection, options, &page);
                Ok(page)
            }
        }
    }

    /// Single record by backend id. A missing record is `None`, not an
    /// error, and is never cached.
    pub async fn fetch_by_id(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        self.fetch_record(collection, RecordOp::ById(id.to_string()))
            .await
    }

    /// Single record by its slug field.
    pub async fn fetch_by_slug(&self, collection: &str, slug: &str) -> Result<Option<Record>> {
        self.fetch_record(collection, RecordOp::BySlug(slug.to_string()))
            .await
    }

    async fn fetch_record(&self, collection: &str, op: RecordOp) -> Result<Option<Record>> {
        let key = entity_key(self.provider.kind(), collection, op.name(), op.ident());
        match self.cache.records.get(&key) {
            Lookup::Hit(record) => Ok(Some(record)),
            Lookup::Stale(record) => {
                self.spawn_record_refresh(key, collection.to_string(), op);
                Ok(Some(record))
            }
            Lookup::Miss => {
                let fetched = self.record_upstream(collection, &op).await?;
                if let Some(record) = &fetched {
                    self.store_record(key, collection, record.clone());
                }
                Ok(fetched)
            }
        }
    }

    /// Create a record. Bypasses the cache read path and invalidates every
    /// entry tagged with the collection on success.
    pub async fn create(&self, collection: &str, data: Value) -> Result<Record> {
        let operation_id = self.operation_id(collection);
        let provider = Arc::clone(&self.provider);
        let target = collection.to_string();

        let record = self
            .resilience
            .execute(&operation_id, &self.write_policy, move || {
                let provider = Arc::clone(&provider);
                let collection = target.clone();
                let data = data.clone();
                async move { provider.create(&collection, data).await }
            })
            .await?;

        self.invalidate_collection(collection, "create");
        Ok(record)
    }

    pub async fn update(&self, collection: &str, id: &str, data: Value) -> Result<Record> {
        let operation_id = self.operation_id(collection);
        let provider = Arc::clone(&self.provider);
        let target = collection.to_string();
        let id = id.to_string();

        let record = self
            .resilience
            .execute(&operation_id, &self.write_policy, move || {
                let provider = Arc::clone(&provider);
                let collection = target.clone();
                let id = id.clone();
                let data = data.clone();
                async move { provider.update(&collection, &id, data).await }
            })
            .await?;

        self.invalidate_collection(collection, "update");
        Ok(record)
    }

    pub async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let operation_id = self.operation_id(collection);
        let provider = Arc::clone(&self.provider);
        let target = collection.to_string();
        let id = id.to_string();

        self.resilience
            .execute(&operation_id, &self.write_policy, move || {
                let provider = Arc::clone(&provider);
                let collection = target.clone();
                let id = id.clone();
                async move { provider.delete(&collection, &id).await }
            })
            .await?;

        self.invalidate_collection(collection, "delete");
        Ok(())
    }

    /// External invalidation trigger (webhooks and the like). Returns the
    /// number of entries removed.
    pub fn revalidate(&self, tags: &[String]) -> usize {
        let removed = self.cache.invalidate_tags(tags);
        info!(?tags, removed, "revalidated cache tags");
        removed
    }

    /// Pre-populate the cache for a listing without inspecting the result.
    pub async fn warm(&self, collection: &str, options: &QueryOptions) -> Result<()> {
        self.fetch_all(collection, options).await.map(|_| ())
    }

    /// Warm several collections concurrently (startup pre-population).
    pub async fn warm_many(
        &self,
        collections: &[String],
        options: &QueryOptions,
    ) -> Vec<(String, Result<()>)> {
        let futures = collections.iter().map(|collection| {
            let collection = collection.clone();
            async move {
                let result = self.warm(&collection, options).await;
                (collection, result)
            }
        });

        futures::future::join_all(futures).await
    }

    /// Listing that degrades to an empty page when the upstream (and its
    /// retries, and the breaker) have given up. The observer keeps the
    /// failure visible to operators.
    pub async fn fetch_all_or_empty<O>(
        &self,
        collection: &str,
        options: &QueryOptions,
        on_error: O,
    ) -> Page<Record>
    where
        O: FnOnce(&Error),
    {
        let empty = Page::empty(options.page, options.page_size);
        with_fallback(
            self.fetch_all(collection, options),
            move || async move { Ok(empty) },
            on_error,
        )
        .await
        .unwrap_or_else(|_| Page::empty(options.page, options.page_size))
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// The breaker guarding a collection's upstream identity.
    pub fn breaker(&self, collection: &str) -> Arc<CircuitBreaker> {
        self.resilience.breaker(&self.operation_id(collection))
    }

    fn operation_id(&self, collection: &str) -> String {
        format!("{}:{}", self.provider.kind().as_str(), collection)
    }

    fn page_key(&self, collection: &str, options: &QueryOptions, op: &PageOp) -> String {
        match op {
            PageOp::FetchAll => query_key(self.provider.kind(), collection, op.name(), options),
            PageOp::Search(query) => {
                let mut keyed = options.clone();
                keyed.search = Some(query.clone());
                query_key(self.provider.kind(), collection, op.name(), &keyed)
            }
        }
    }

    fn entry_tags(&self, collection: &str, extra: &[String]) -> HashSet<String> {
        let mut tags: HashSet<String> = extra.iter().cloned().collect();
        tags.insert(collection.to_string());
        tags
    }

    fn store_page(&self, key: String, collection: &str, options: &QueryOptions, page: &Page<Record>) {
        self.cache.set_page(
            key,
            page.clone(),
            self.config.cache_ttl(),
            self.config.stale_window(),
            self.entry_tags(collection, &options.tags),
        );
    }

    fn store_record(&self, key: String, collection: &str, record: Record) {
        self.cache.set_record(
            key,
            record,
            self.config.cache_ttl(),
            self.config.stale_window(),
            self.entry_tags(collection, &[]),
        );
    }

    fn invalidate_collection(&self, collection: &str, operation: &str) {
        let removed = self.cache.invalidate_tags(&[collection.to_string()]);
        debug!(collection, operation, removed, "invalidated collection cache");
    }

    async fn page_upstream(
        &self,
        collection: &str,
        options: &QueryOptions,
        op: &PageOp,
    ) -> Result<Page<Record>> {
        let operation_id = self.operation_id(collection);
        let provider = Arc::clone(&self.provider);
        let collection = collection.to_string();
        let options = options.clone();
        let op = op.clone();

        self.resilience
            .execute(&operation_id, &self.read_policy, move || {
                let provider = Arc::clone(&provider);
                let collection = collection.clone();
                let options = options.clone();
                let op = op.clone();
                async move {
                    match &op {
                        PageOp::FetchAll => provider.fetch_all(&collection, &options).await,
                        PageOp::Search(query) => {
                            provider.search(&collection, query, &options).await
                        }
                    }
                }
            })
            .await
    }

    async fn record_upstream(&self, collection: &str, op: &RecordOp) -> Result<Option<Record>> {
        let operation_id = self.operation_id(collection);
        let provider = Arc::clone(&self.provider);
        let collection = collection.to_string();
        let op = op.clone();

        let result = self
            .resilience
            .execute(&operation_id, &self.read_policy, move || {
                let provider = Arc::clone(&provider);
                let collection = collection.clone();
                let op = op.clone();
                async move {
                    match &op {
                        RecordOp::ById(id) => provider.fetch_by_id(&collection, id).await,
                        RecordOp::BySlug(slug) => provider.fetch_by_slug(&collection, slug).await,
                    }
                }
            })
            .await;

        match result {
            Ok(found) => Ok(found),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Fire-and-forget refresh of a stale page entry. At most one refresh
    /// per key is in flight; failures are logged, never propagated (the
    /// caller already holds a servable stale value).
    fn spawn_page_refresh(
        &self,
        key: String,
        collection: String,
        options: QueryOptions,
        op: PageOp,
    ) {
        if !self.refreshing.insert(key.clone()) {
            return;
        }

        let provider = Arc::clone(&self.provider);
        let resilience = Arc::clone(&self.resilience);
        let cache = self.cache.clone();
        let refreshing = Arc::clone(&self.refreshing);
        let policy = self.read_policy.clone();
        let ttl = self.config.cache_ttl();
        let stale_window = self.config.stale_window();
        let tags = self.entry_tags(&collection, &options.tags);
        let operation_id = self.operation_id(&collection);

        tokio::spawn(async move {
            let result = resilience
                .execute(&operation_id, &policy, || {
                    let provider = Arc::clone(&provider);
                    let collection = collection.clone();
                    let options = options.clone();
                    let op = op.clone();
                    async move {
                        match &op {
                            PageOp::FetchAll => provider.fetch_all(&collection, &options).await,
                            PageOp::Search(query) => {
                                provider.search(&collection, query, &options).await
                            }
                        }
                    }
                })
                .await;

            match result {
                Ok(page) => {
                    cache.set_page(key.clone(), page, ttl, stale_window, tags);
                    debug!(key = %key, "background refresh updated cache entry");
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "background refresh failed");
                }
            }
            refreshing.remove(&key);
        });
    }

    /// Fire-and-forget refresh of a stale record entry. A record that has
    /// disappeared upstream is invalidated rather than re-written.
    fn spawn_record_refresh(&self, key: String, collection: String, op: RecordOp) {
        if !self.refreshing.insert(key.clone()) {
            return;
        }

        let provider = Arc::clone(&self.provider);
        let resilience = Arc::clone(&self.resilience);
        let cache = self.cache.clone();
        let refreshing = Arc::clone(&self.refreshing);
        let policy = self.read_policy.clone();
        let ttl = self.config.cache_ttl();
        let stale_window = self.config.stale_window();
        let tags = self.entry_tags(&collection, &[]);
        let operation_id = self.operation_id(&collection);

        tokio::spawn(async move {
            let result = resilience
                .execute(&operation_id, &policy, || {
                    let provider = Arc::clone(&provider);
                    let collection = collection.clone();
                    let op = op.clone();
                    async move {
                        match &op {
                            RecordOp::ById(id) => provider.fetch_by_id(&collection, id).await,
                            RecordOp::BySlug(slug) => {
                                provider.fetch_by_slug(&collection, slug).await
                            }
                        }
                    }
                })
                .await;

            match result {
                Ok(Some(record)) => {
                    cache.set_record(key.clone(), record, ttl, stale_window, tags);
                    debug!(key = %key, "background refresh updated cache entry");
                }
                Ok(None) => {
                    cache.records.invalidate(Some(std::slice::from_ref(&key)), None);
                    debug!(key = %key, "record gone upstream, dropped cache entry");
                }
                Err(err) => {
                    warn!(key = %key, error = %err, "background refresh failed");
                }
            }
            refreshing.remove(&key);
        });
    }
}
