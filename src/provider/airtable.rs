use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::debug;

use crate::config::{ProviderConfig, ProviderKind};
use crate::error::{Error, Result};
use crate::provider::{Page, Provider, QueryOptions, Record, SortOrder};

// Airtable caps list requests at 100 records per call
const MAX_PAGE_SIZE: usize = 100;

/// Reference adapter for the Airtable REST API. Translates the uniform
/// query contract into filterByFormula/sort/offset parameters and
/// normalizes the record envelope. No caching or retries here; the facade
/// composes those around every adapter uniformly.
#[derive(Debug, Clone)]
pub struct AirtableProvider {
    client: Client,
    base_url: String,
    base_id: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct AirtableRecord {
    id: String,
    #[serde(rename = "createdTime")]
    created_time: Option<DateTime<Utc>>,
    #[serde(default)]
    fields: serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct AirtableList {
    #[serde(default)]
    records: Vec<AirtableRecord>,
    offset: Option<String>,
}

impl AirtableProvider {
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let base_url = config
            .base_url
            .clone()
            .ok_or_else(|| Error::Config("base_url is required for airtable".into()))?;
        let token = config
            .token
            .clone()
            .ok_or_else(|| Error::Config("token is required for airtable".into()))?;
        let base_id = config
            .dataset_id
            .clone()
            .ok_or_else(|| Error::Config("dataset_id is required for airtable".into()))?;

        url::Url::parse(&base_url).map_err(|_| Error::InvalidUrl(base_url.clone()))?;

        let client = Client::builder()
            .timeout(config.request_timeout())
            .gzip(true)
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            base_id,
            token,
        })
    }

    fn table_url(&self, collection: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.base_id, collection)
    }

    fn record_url(&self, collection: &str, id: &str) -> String {
        format!("{}/{}", self.table_url(collection), id)
    }

    async fn send(&self, request: reqwest::RequestBuilder, context: &str) -> Result<Response> {
        let response = request
            .header("Authorization", format!("Bearer {}", self.token))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    Error::Timeout(format!("request to {} timed out", context))
                } else {
                    Error::Http(format!("request to {} failed: {}", context, e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::from_status(status.as_u16(), context));
        }
        Ok(response)
    }

    async fn decode_record(&self, response: Response, context: &str) -> Result<Record> {
        let raw: AirtableRecord = response
            .json()
            .await
            .map_err(|e| Error::Decode(format!("{}: {}", context, e)))?;
        Ok(normalize(raw))
    }

    async fn list_page(&self, collection: &str, params: &[(String, String)]) -> Result<AirtableList> {
        let context = format!("{}/{}", self.base_id, collection);
        let response = self
            .send(self.client.get(self.table_url(collection)).query(params), &context)
            .await?;

        response
            .json()
            .await
            .map_err(|e| Error::Decode(format!("{}: {}", context, e)))
    }

    /// Walk offset pages until enough rows exist to answer the requested
    /// page, plus one to detect a following page. Returns the collected
    /// rows and whether the upstream was exhausted.
    async fn collect_rows(
        &self,
        collection: &str,
        options: &QueryOptions,
        formula: Option<String>,
    ) -> Result<(Vec<Record>, bool)> {
        let needed = options.offset() + options.page_size as usize + 1;
        let mut rows: Vec<Record> = Vec::new();
        let mut offset_token: Option<String> = None;

        loop {
            let mut params: Vec<(String, String)> =
                vec![("pageSize".into(), MAX_PAGE_SIZE.to_string())];

            if let Some(formula) = &formula {
                params.push(("filterByFormula".into(), formula.clone()));
            }
            if let Some(sort) = &options.sort {
                params.push(("sort[0][field]".into(), sort.field.clone()));
                let direction = match sort.order {
                    SortOrder::Asc => "asc",
                    SortOrder::Desc => "desc",
                };
                params.push(("sort[0][direction]".into(), direction.into()));
            }
            if let Some(fields) = &options.fields {
                for field in fields {
                    params.push(("fields[]".into(), field.clone()));
                }
            }
            if let Some(token) = &offset_token {
                params.push(("offset".into(), token.clone()));
            }

            let list = self.list_page(collection, &params).await?;
            debug!(
                collection,
                fetched = list.records.len(),
                collected = rows.len(),
                "fetched airtable page"
            );
            rows.extend(list.records.into_iter().map(normalize));

            match list.offset {
                Some(token) if rows.len() < needed => offset_token = Some(token),
                Some(_) => return Ok((rows, false)),
                None => return Ok((rows, true)),
            }
        }
    }

    fn paginate(rows: Vec<Record>, options: &QueryOptions, exhausted: bool) -> Page<Record> {
        let offset = options.offset();
        // exact when the walk exhausted the collection, else a lower bound
        let total = rows.len();
        let data: Vec<Record> = rows
            .into_iter()
            .skip(offset)
            .take(options.page_size as usize)
            .collect();
        let has_more = if exhausted {
            offset + data.len() < total
        } else {
            true
        };

        Page {
            data,
            total,
            page: options.page,
            page_size: options.page_size,
            has_more,
        }
    }
}

fn normalize(raw: AirtableRecord) -> Record {
    let slug = raw
        .fields
        .get("slug")
        .and_then(Value::as_str)
        .map(str::to_string);

    Record {
        id: raw.id,
        slug,
        fields: raw.fields,
        created_at: raw.created_time,
        updated_at: None,
    }
}

fn formula_value(value: &Value) -> String {
    match value {
        Value::String(s) => format!("'{}'", s.replace('\'', "\\'")),
        Value::Bool(true) => "TRUE()".to_string(),
        Value::Bool(false) => "FALSE()".to_string(),
        Value::Number(n) => n.to_string(),
        other => format!("'{}'", other.to_string().replace('\'', "\\'")),
    }
}

fn filter_formula(options: &QueryOptions) -> Option<String> {
    let clauses: Vec<String> = options
        .filters
        .iter()
        .map(|(field, value)| format!("{{{}}}={}", field, formula_value(value)))
        .collect();
    combine_clauses(clauses)
}

fn search_formula(query: &str, fields: &[String]) -> String {
    let needle = query.to_lowercase().replace('\'', "\\'");
    let clauses: Vec<String> = fields
        .iter()
        .map(|field| format!("SEARCH('{}', LOWER({{{}}}))", needle, field))
        .collect();
    if clauses.len() == 1 {
        clauses.into_iter().next().unwrap()
    } else {
        format!("OR({})", clauses.join(","))
    }
}

fn combine_clauses(clauses: Vec<String>) -> Option<String> {
    match clauses.len() {
        0 => None,
        1 => clauses.into_iter().next(),
        _ => Some(format!("AND({})", clauses.join(","))),
    }
}

fn record_matches_search(record: &Record, needle: &str) -> bool {
    let needle = needle.to_lowercase();
    record
        .fields
        .values()
        .any(|value| value.as_str().map_or(false, |s| s.to_lowercase().contains(&needle)))
}

#[async_trait]
impl Provider for AirtableProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Airtable
    }

    async fn fetch_all(&self, collection: &str, options: &QueryOptions) -> Result<Page<Record>> {
        let (rows, exhausted) = self
            .collect_rows(collection, options, filter_formula(options))
            .await?;
        Ok(Self::paginate(rows, options, exhausted))
    }

    async fn fetch_by_id(&self, collection: &str, id: &str) -> Result<Option<Record>> {
        let context = format!("{}/{}/{}", self.base_id, collection, id);
        let result = self
            .send(self.client.get(self.record_url(collection, id)), &context)
            .await;

        match result {
            Ok(response) => Ok(Some(self.decode_record(response, &context).await?)),
            Err(Error::NotFound(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn fetch_by_slug(&self, collection: &str, slug: &str) -> Result<Option<Record>> {
        let formula = format!("{{slug}}={}", formula_value(&Value::String(slug.to_string())));
        let params = vec![
            ("pageSize".to_string(), "1".to_string()),
            ("filterByFormula".to_string(), formula),
        ];

        let list = self.list_page(collection, &params).await?;
        Ok(list.records.into_iter().next().map(normalize))
    }

    async fn create(&self, collection: &str, data: Value) -> Result<Record> {
        if !data.is_object() {
            return Err(Error::InvalidRequest("record data must be an object".into()));
        }

        let context = format!("{}/{}", self.base_id, collection);
        let response = self
            .send(
                self.client
                    .post(self.table_url(collection))
                    .json(&json!({ "fields": data })),
                &context,
            )
            .await?;
        self.decode_record(response, &context).await
    }

    async fn update(&self, collection: &str, id: &str, data: Value) -> Result<Record> {
        if !data.is_object() {
            return Err(Error::InvalidRequest("record data must be an object".into()));
        }

        let context = format!("{}/{}/{}", self.base_id, collection, id);
        let response = self
            .send(
                self.client
                    .patch(self.record_url(collection, id))
                    .json(&json!({ "fields": data })),
                &context,
            )
            .await?;
        self.decode_record(response, &context).await
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        let context = format!("{}/{}/{}", self.base_id, collection, id);
        self.send(self.client.delete(self.record_url(collection, id)), &context)
            .await?;
        Ok(())
    }

    async fn search(
        &self,
        collection: &str,
        query: &str,
        options: &QueryOptions,
    ) -> Result<Page<Record>> {
        match &options.fields {
            // Restricted field set: push the match upstream as a formula
            Some(fields) if !fields.is_empty() => {
                let mut clauses = Vec::new();
                if let Some(filters) = filter_formula(options) {
                    clauses.push(filters);
                }
                clauses.push(search_formula(query, fields));

                let (rows, exhausted) = self
                    .collect_rows(collection, options, combine_clauses(clauses))
                    .await?;
                Ok(Self::paginate(rows, options, exhausted))
            }
            // No generic full-text operator upstream: fetch the filtered
            // set and match string cells client-side
            _ => {
                let mut unpaged = options.clone();
                unpaged.page = 1;
                unpaged.page_size = u32::MAX;

                let (rows, _) = self
                    .collect_rows(collection, &unpaged, filter_formula(options))
                    .await?;
                let matched: Vec<Record> = rows
                    .into_iter()
                    .filter(|record| record_matches_search(record, query))
                    .collect();
                Ok(Self::paginate(matched, options, true))
            }
        }
    }
}
