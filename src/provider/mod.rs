pub mod airtable;
pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{Error, Result};

pub use airtable::AirtableProvider;
pub use memory::MemoryProvider;

/// A single normalized content record, independent of backend shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub slug: Option<String>,
    pub fields: serde_json::Map<String, Value>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Record {
    pub fn new(id: impl Into<String>, fields: serde_json::Map<String, Value>) -> Self {
        let slug = fields
            .get("slug")
            .and_then(Value::as_str)
            .map(str::to_string);

        Self {
            id: id.into(),
            slug,
            fields,
            created_at: None,
            updated_at: None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

/// Normalized paginated result shape shared by every adapter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: usize,
    pub page: u32,
    pub page_size: u32,
    pub has_more: bool,
}

impl<T> Page<T> {
    pub fn empty(page: u32, page_size: u32) -> Self {
        Self {
            data: Vec::new(),
            total: 0,
            page,
            page_size,
            has_more: false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    Desc,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sort {
    pub field: String,
    pub order: SortOrder,
}

/// Uniform query contract. Filter keys are passed through untyped; the
/// adapter rejects or ignores fields it does not understand.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryOptions {
    pub page: u32,
    pub page_size: u32,

    #[serde(default)]
    pub filters: BTreeMap<String, Value>,

    #[serde(default)]
    pub sort: Option<Sort>,

    #[serde(default)]
    pub search: Option<String>,

    #[serde(default)]
    pub fields: Option<Vec<String>>,

    /// Extra cache tags to attach beyond the collection name.
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            page: 1,
            page_size: 20,
            filters: BTreeMap::new(),
            sort: None,
            search: None,
            fields: None,
            tags: Vec::new(),
        }
    }
}

impl QueryOptions {
    pub fn page(page: u32, page_size: u32) -> Self {
        Self {
            page,
            page_size,
            ..Default::default()
        }
    }

    pub fn with_filter(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.filters.insert(key.into(), value.into());
        self
    }

    pub fn with_sort(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.sort = Some(Sort {
            field: field.into(),
            order,
        });
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.page < 1 {
            return Err(Error::InvalidRequest("page must be >= 1".into()));
        }
        if self.page_size == 0 {
            return Err(Error::InvalidRequest("page_size must be > 0".into()));
        }
        Ok(())
    }

    /// Zero-based offset of the first requested row.
    pub fn offset(&self) -> usize {
        (self.page as usize - 1) * self.page_size as usize
    }
}

/// Backend adapter contract. Each method performs upstream calls and
/// returns the normalized shape; adapters never cache, retry, or break
/// circuits themselves.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    async fn fetch_all(&self, collection: &str, options: &QueryOptions) -> Result<Page<Record>>;

    async fn fetch_by_id(&self, collection: &str, id: &str) -> Result<Option<Record>>;

    async fn fetch_by_slug(&self, collection: &str, slug: &str) -> Result<Option<Record>>;

    async fn create(&self, collection: &str, data: Value) -> Result<Record>;

    async fn update(&self, collection: &str, id: &str, data: Value) -> Result<Record>;

    async fn delete(&self, collection: &str, id: &str) -> Result<()>;

    async fn search(
        &self,
        collection: &str,
        query: &str,
        options: &QueryOptions,
    ) -> Result<Page<Record>>;
}

/// Instantiate the adapter selected by the validated config.
pub fn build(config: &ProviderConfig) -> Result<Arc<dyn Provider>> {
    match config.kind {
        ProviderKind::Airtable => Ok(Arc::new(AirtableProvider::from_config(config)?)),
        ProviderKind::Memory => Ok(Arc::new(MemoryProvider::new())),
    }
}
