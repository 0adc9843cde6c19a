use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde_json::Value;

use crate::config::ProviderKind;
use crate::error::{Error, Result};
use crate::provider::{Page, Provider, QueryOptions, Record, SortOrder};

/// In-process table backend for tests and development. Collections are
/// plain vectors in insertion order, so pagination is stable.
pub struct MemoryProvider {
    collections: Arc<RwLock<HashMap<String, Vec<Record>>>>,
    next_id: AtomicU64,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self {
            collections: Arc::new(RwLock::new(HashMap::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Insert a record directly, bypassing the write path (test seeding).
    pub fn seed(&self, collection: &str, record: Record) {
        let mut collections = self.collections.write();
        collections
            .entry(collection.to_string())
            .or_insert_with(Vec::new)
            .push(record);
    }

    pub fn len(&self, collection: &str) -> usize {
        self.collections
            .read()
            .get(collection)
            .map_or(0, Vec::len)
    }

    fn matches_filters(record: &Record, filters: &std::collections::BTreeMap<String, Value>) -> bool {
        filters.iter().all(|(key, expected)| match key.as_str() {
            "id" => expected.as_str() == Some(record.id.as_str()),
            "slug" => expected.as_str() == record.slug.as_deref(),
            field => record.fields.get(field) == Some(expected),
        })
    }

    fn matches_search(record: &Record, needle: &str, fields: Option<&Vec<String>>) -> bool {
        let needle = needle.to_lowercase();
        record.fields.iter().any(|(name, value)| {
            if let Some(allowed) = fields {
                if !allowed.contains(name) {
                    return false;
                }
            }
            value
                .as_str()
                .map_or(false, |s| s.to_lowercase().contains(&needle))
        })
    }

    fn compare_values(a: Option<&Value>, b: Option<&Value>) -> std::cmp::Ordering {
        use std::cmp::Ordering as O;
        match (a, b) {
            (Some(Value::Number(x)), Some(Value::Number(y))) => x
                .as_f64()
                .partial_cmp(&y.as_f64())
                .unwrap_or(O::Equal),
            (Some(x), Some(y)) => {
                let xs = x.as_str().map(str::to_string).unwrap_or_else(|| x.to_string());
                let ys = y.as_str().map(str::to_string).unwrap_or_else(|| y.to_string());
                xs.cmp(&ys)
            }
            (Some(_), None) => O::Less,
            (None, Some(_)) => O::Greater,
            (None, None) => O::Equal,
        }
    }

    fn select(&self, collection: &str, options: &QueryOptions, search: Option<&str>) -> Page<Record> {
        let collections = self.collections.read();
        let rows = collections.get(collection).cloned().unwrap_or_default();

        let mut matched: Vec<Record> = rows
            .into_iter()
            .filter(|record| Self::matches_filters(record, &options.filters))
            .filter(|record| {
                search.map_or(true, |q| {
                    Self::matches_search(record, q, options.fields.as_ref())
                })
            })
            .collect();

        if let Some(sort) = &options.sort {
            matched.sort_by(|a, b| {
                let ordering =
                    Self::compare_values(a.fields.get(&sort.field), b.fields.get(&sort.field));
                match sort.order {
                    SortOrder::Asc => ordering,
                    SortOrder::Desc => ordering.reverse(),
                }
            });
        }

        let total = matched.len();
        let offset = options.offset();
        let data: Vec<Record> = matched
            .into_iter()
            .skip(offset)
            .take(options.page_size as usize)
            .collect();
        let has_more = offset + data.len() < total;

        Page {
            data,
            total,
            page: options.page,
            page_size: options.page_size,
            has_more,
        }
    }
}

impl Default for MemoryProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Memory
    }

    async fn fetch_all(&self, collection: &str, options: &QueryOptions) -> Result<Page<Record>> {
        Ok(self.select(collection, options, None))
    }

    async fn fetch_by_id(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        let collections = self.collections.read();
        Ok(collections
            .get(collection)
            .and_then(|rows| rows.iter().find(|r| r.id == id).cloned()))
    }

    async fn fetch_by_slug(&self, collection: &str, slug: &str) -> Result<Option<Record>> {
        let collections = self.collections.read();
        Ok(collections
            .get(collection)
            .and_then(|rows| rows.iter().find(|r| r.slug.as_deref() == Some(slug)).cloned()))
    }

    async fn create(&self, collection: &str, data: Value) -> Result<Record> {
        let fields = match data {
            Value::Object(map) => map,
            _ => return Err(Error::InvalidRequest("record data must be an object".into())),
        };

        let id = format!("rec{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut record = Record::new(id, fields);
        record.created_at = Some(Utc::now());

        self.seed(collection, record.clone());
        Ok(record)
    }

    async fn update(&self, collection: &str, id: &str, data: Value) -> Result<Record> {
        let patch = match data {
            Value::Object(map) => map,
            _ => return Err(Error::InvalidRequest("record data must be an object".into())),
        };

        let mut collections = self.collections.write();
        let rows = collections
            .get_mut(collection)
            .ok_or_else(|| Error::NotFound(format!("{}/{}", collection, id)))?;

        let record = rows
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::NotFound(format!("{}/{}", collection, id)))?;

        for (key, value) in patch {
            record.fields.insert(key, value);
        }
        record.slug = record
            .fields
            .get("slug")
            .and_then(Value::as_str)
            .map(str::to_string);
        record.updated_at = Some(Utc::now());

        Ok(record.clone())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let mut collections = self.collections.write();
        let rows = collections
            .get_mut(collection)
            .ok_or_else(|| Error::NotFound(format!("{}/{}", collection, id)))?;

        let before = rows.len();
        rows.retain(|r| r.id != id);

        if rows.len() == before {
            return Err(Error::NotFound(format!("{}/{}", collection, id)));
        }
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: &str,
        options: &QueryOptions,
    ) -> Result<Page<Record>> {
        Ok(self.select(collection, options, Some(query)))
    }
}
