use crate::config::ProviderKind;
use crate::provider::{QueryOptions, SortOrder};

/// Deterministic cache key for a paginated query. Equivalent queries hash
/// identically regardless of the order filters were inserted in: filter
/// keys are iterated sorted and values rendered as canonical JSON.
pub fn query_key(
    kind: ProviderKind,
    collection: &str,
    operation: &str,
    options: &QueryOptions,
) -> String {
    let input = format!(
        "{}:{}:{}:{}",
        kind.as_str(),
        collection,
        operation,
        normalized_query(options)
    );
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

/// Deterministic cache key for a single-record lookup by id or slug.
pub fn entity_key(kind: ProviderKind, collection: &str, operation: &str, ident: &str) -> String {
    let input = format!("{}:{}:{}:{}", kind.as_str(), collection, operation, ident);
    blake3::hash(input.as_bytes()).to_hex().to_string()
}

fn normalized_query(options: &QueryOptions) -> String {
    let mut parts = Vec::new();

    parts.push(format!("page={}", options.page));
    parts.push(format!("size={}", options.page_size));

    // BTreeMap iterates in sorted key order
    for (key, value) in &options.filters {
        parts.push(format!("f.{}={}", key, value));
    }

    if let Some(sort) = &options.sort {
        let order = match sort.order {
            SortOrder::Asc => "asc",
            SortOrder::Desc => "desc",
        };
        parts.push(format!("sort={}:{}", sort.field, order));
    }

    if let Some(search) = &options.search {
        parts.push(format!("q={}", search));
    }

    if let Some(fields) = &options.fields {
        let mut sorted = fields.clone();
        sorted.sort();
        parts.push(format!("fields={}", sorted.join(",")));
    }

    parts.join("&")
}
