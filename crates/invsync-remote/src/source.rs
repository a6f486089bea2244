//! The remote catalog source abstraction.
//!
//! A [`RemoteSource`] performs raw reads against the external inventory API
//! and returns undecoded responses. Classification, content-type validation
//! and decoding happen in the [`RemoteClient`](crate::RemoteClient), so every
//! source (HTTP, in-memory, fault-injecting) is treated identically.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use invsync_core::{NaturalKey, RecordFilter, RecordKind};

use crate::error::Result;

/// One paginated read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    pub kind: RecordKind,
    /// Opaque cursor from the previous page; `None` for the first page.
    pub cursor: Option<String>,
    /// Requested page size.
    pub limit: usize,
    pub filter: RecordFilter,
    /// Requested fields; `None` for all fields.
    pub fields: Option<Vec<String>>,
    /// Restrict the listing to these keys.
    pub keys: Option<Vec<NaturalKey>>,
}

/// One bulk report export.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportRequest {
    pub kind: RecordKind,
    pub filter: RecordFilter,
    pub fields: Option<Vec<String>>,
}

/// An undecoded response.
#[derive(Debug, Clone)]
pub struct RawResponse {
    /// HTTP-equivalent status code.
    pub status: u16,
    /// Reported content type, if any.
    pub content_type: Option<String>,
    pub body: Bytes,
    /// Server wait hint (e.g. `Retry-After`).
    pub retry_after: Option<Duration>,
}

impl RawResponse {
    /// A 200 response with the given content type.
    pub fn ok(content_type: &str, body: impl Into<Bytes>) -> Self {
        Self {
            status: 200,
            content_type: Some(content_type.to_string()),
            body: body.into(),
            retry_after: None,
        }
    }

    /// An error response with a plain-text body.
    pub fn status(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            content_type: Some("text/plain".to_string()),
            body: body.into(),
            retry_after: None,
        }
    }
}

/// A streamed body chunk.
pub type BodyStream = BoxStream<'static, Result<Bytes>>;

/// An undecoded streamed response, used for bulk reports.
pub struct StreamResponse {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: BodyStream,
    pub retry_after: Option<Duration>,
}

impl StreamResponse {
    /// Wrap a fully-buffered response as a single-chunk stream.
    pub fn from_raw(raw: RawResponse) -> Self {
        let body = raw.body;
        Self {
            status: raw.status,
            content_type: raw.content_type,
            body: Box::pin(futures::stream::once(async move { Ok(body) })),
            retry_after: raw.retry_after,
        }
    }
}

impl std::fmt::Debug for StreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamResponse")
            .field("status", &self.status)
            .field("content_type", &self.content_type)
            .field("retry_after", &self.retry_after)
            .finish_non_exhaustive()
    }
}

/// Raw access to the remote catalog.
///
/// Implementations return `Err` only for failures below the HTTP layer
/// (connection refused, timeouts); every server answer, including errors,
/// is an `Ok` response with its status.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Read one page of a listing.
    async fn fetch_page(&self, request: &PageRequest) -> Result<RawResponse>;

    /// Start a bulk report export.
    async fn fetch_report(&self, request: &ReportRequest) -> Result<StreamResponse>;
}

/// The collection path segment for a kind.
pub fn collection(kind: RecordKind) -> &'static str {
    match kind {
        RecordKind::Item => "items",
        RecordKind::Vendor => "vendors",
    }
}

/// An in-memory catalog that answers with genuine JSON and NDJSON payloads.
///
/// Used by tests and demos. Supports cursors, key sets, modified-since and
/// active-only filters, and field scopes.
pub mod memory {
    use super::*;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::RwLock;

    use invsync_core::{normalize_value, NormalizedValue, RemoteRecord, Timestamp};
    use serde_json::{json, Map, Value};

    use crate::decode::{KeyFields, LAST_MODIFIED_FIELD, NDJSON};
    use crate::error::RemoteError;

    #[derive(Debug, Clone)]
    struct Entry {
        fields: BTreeMap<String, Value>,
        modified_at: Option<Timestamp>,
    }

    /// In-memory remote catalog.
    pub struct MemorySource {
        catalog: RwLock<BTreeMap<(RecordKind, NaturalKey), Entry>>,
        key_fields: KeyFields,
        page_requests: AtomicU64,
        report_requests: AtomicU64,
    }

    impl MemorySource {
        /// Create an empty catalog.
        pub fn new() -> Self {
            Self {
                catalog: RwLock::new(BTreeMap::new()),
                key_fields: KeyFields::default(),
                page_requests: AtomicU64::new(0),
                report_requests: AtomicU64::new(0),
            }
        }

        /// Insert or replace a record.
        pub fn put(&self, record: RemoteRecord) {
            if let Ok(mut catalog) = self.catalog.write() {
                catalog.insert(
                    (record.kind, record.key),
                    Entry {
                        fields: record.fields,
                        modified_at: record.remote_modified_at,
                    },
                );
            }
        }

        /// Set one field of an existing record, optionally bumping its
        /// modification time. Returns `false` if the record does not exist.
        pub fn set_field(
            &self,
            kind: RecordKind,
            key: &NaturalKey,
            name: &str,
            value: impl Into<Value>,
            modified_at: Option<Timestamp>,
        ) -> bool {
            let Ok(mut catalog) = self.catalog.write() else {
                return false;
            };
            match catalog.get_mut(&(kind, key.clone())) {
                Some(entry) => {
                    entry.fields.insert(name.to_string(), value.into());
                    if modified_at.is_some() {
                        entry.modified_at = modified_at;
                    }
                    true
                }
                None => false,
            }
        }

        /// Remove a record.
        pub fn remove(&self, kind: RecordKind, key: &NaturalKey) -> bool {
            self.catalog
                .write()
                .map(|mut c| c.remove(&(kind, key.clone())).is_some())
                .unwrap_or(false)
        }

        /// Number of records of a kind.
        pub fn len(&self, kind: RecordKind) -> usize {
            self.catalog
                .read()
                .map(|c| c.keys().filter(|(k, _)| *k == kind).count())
                .unwrap_or(0)
        }

        pub fn is_empty(&self) -> bool {
            self.catalog.read().map(|c| c.is_empty()).unwrap_or(true)
        }

        /// Page requests served so far.
        pub fn page_requests(&self) -> u64 {
            self.page_requests.load(Ordering::Relaxed)
        }

        /// Report requests served so far.
        pub fn report_requests(&self) -> u64 {
            self.report_requests.load(Ordering::Relaxed)
        }

        /// Records matching a filter, key set and field scope, in key order.
        fn select(
            &self,
            kind: RecordKind,
            filter: RecordFilter,
            keys: Option<&[NaturalKey]>,
            fields: Option<&[String]>,
        ) -> Result<Vec<Map<String, Value>>> {
            let catalog = self
                .catalog
                .read()
                .map_err(|e| RemoteError::transport(format!("catalog poisoned: {}", e)))?;
            let key_set: Option<BTreeSet<&NaturalKey>> = keys.map(|k| k.iter().collect());
            let key_field = self.key_fields.for_kind(kind);

            Ok(catalog
                .iter()
                .filter(|((k, key), _)| *k == kind && key_set.as_ref().map_or(true, |s| s.contains(key)))
                .filter(|(_, entry)| matches_filter(entry, filter))
                .map(|((_, key), entry)| {
                    let mut obj = Map::new();
                    obj.insert(key_field.to_string(), Value::String(key.to_string()));
                    for (name, value) in &entry.fields {
                        if fields.map_or(true, |f| f.iter().any(|n| n == name)) {
                            obj.insert(name.clone(), value.clone());
                        }
                    }
                    if let Some(at) = entry.modified_at {
                        obj.insert(LAST_MODIFIED_FIELD.to_string(), json!(at));
                    }
                    obj
                })
                .collect())
        }
    }

    impl Default for MemorySource {
        fn default() -> Self {
            Self::new()
        }
    }

    fn matches_filter(entry: &Entry, filter: RecordFilter) -> bool {
        match filter {
            RecordFilter::All => true,
            // Records without a timestamp are always included.
            RecordFilter::ModifiedSince(since) => entry.modified_at.map_or(true, |at| at >= since),
            RecordFilter::ActiveOnly => is_active(&entry.fields),
        }
    }

    /// A record is active unless its status says otherwise.
    fn is_active(fields: &BTreeMap<String, Value>) -> bool {
        match fields.get("status").map(normalize_value) {
            Some(NormalizedValue::Text(s)) => {
                !matches!(s.to_ascii_lowercase().as_str(), "inactive" | "discontinued" | "archived")
            }
            Some(NormalizedValue::Bool(active)) => active,
            _ => true,
        }
    }

    #[async_trait]
    impl RemoteSource for MemorySource {
        async fn fetch_page(&self, request: &PageRequest) -> Result<RawResponse> {
            self.page_requests.fetch_add(1, Ordering::Relaxed);

            let records = self.select(
                request.kind,
                request.filter,
                request.keys.as_deref(),
                request.fields.as_deref(),
            )?;

            let offset: usize = match &request.cursor {
                None => 0,
                Some(c) => match c.parse() {
                    Ok(n) => n,
                    Err(_) => return Ok(RawResponse::status(400, format!("bad cursor {:?}", c))),
                },
            };
            let limit = request.limit.max(1);
            let end = (offset + limit).min(records.len());
            let page: Vec<Value> = records
                .get(offset..end)
                .unwrap_or_default()
                .iter()
                .cloned()
                .map(Value::Object)
                .collect();
            let next_cursor = (end < records.len()).then(|| end.to_string());

            let body = json!({ "records": page, "next_cursor": next_cursor });
            Ok(RawResponse::ok("application/json", body.to_string()))
        }

        async fn fetch_report(&self, request: &ReportRequest) -> Result<StreamResponse> {
            self.report_requests.fetch_add(1, Ordering::Relaxed);

            let records = self.select(request.kind, request.filter, None, request.fields.as_deref())?;

            let mut columns: BTreeSet<String> = records
                .iter()
                .flat_map(|r| r.keys().cloned())
                .collect();
            columns.insert(self.key_fields.for_kind(request.kind).to_string());
            let columns: Vec<String> = columns.into_iter().collect();

            let mut body = String::new();
            body.push_str(&Value::from(columns.clone()).to_string());
            body.push('\n');
            for record in &records {
                let row: Vec<Value> = columns
                    .iter()
                    .map(|c| record.get(c).cloned().unwrap_or(Value::Null))
                    .collect();
                body.push_str(&Value::Array(row).to_string());
                body.push('\n');
            }

            Ok(StreamResponse::from_raw(RawResponse::ok(NDJSON, body)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemorySource;
    use super::*;
    use futures::StreamExt;
    use invsync_core::RemoteRecord;
    use serde_json::Value;

    fn key(s: &str) -> NaturalKey {
        NaturalKey::new(s).unwrap()
    }

    fn source_with(n: usize) -> MemorySource {
        let source = MemorySource::new();
        for i in 0..n {
            source.put(
                RemoteRecord::new(RecordKind::Item, key(&format!("SKU{:03}", i)))
                    .with_field("quantity_on_hand", i as i64)
                    .with_field("status", if i % 2 == 0 { "active" } else { "inactive" })
                    .modified_at(i as i64 * 10),
            );
        }
        source
    }

    fn page_request(cursor: Option<&str>, limit: usize, filter: RecordFilter) -> PageRequest {
        PageRequest {
            kind: RecordKind::Item,
            cursor: cursor.map(str::to_string),
            limit,
            filter,
            fields: None,
            keys: None,
        }
    }

    fn records_of(raw: &RawResponse) -> (Vec<Value>, Value) {
        let v: Value = serde_json::from_slice(&raw.body).unwrap();
        (v["records"].as_array().unwrap().clone(), v["next_cursor"].clone())
    }

    #[tokio::test]
    async fn test_memory_source_paginates() {
        let source = source_with(5);

        let first = source
            .fetch_page(&page_request(None, 2, RecordFilter::All))
            .await
            .unwrap();
        assert_eq!(first.status, 200);
        let (records, cursor) = records_of(&first);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["sku"], "SKU000");
        assert_eq!(cursor, "2");

        let last = source
            .fetch_page(&page_request(Some("4"), 2, RecordFilter::All))
            .await
            .unwrap();
        let (records, cursor) = records_of(&last);
        assert_eq!(records.len(), 1);
        assert!(cursor.is_null());
        assert_eq!(source.page_requests(), 2);
    }

    #[tokio::test]
    async fn test_memory_source_filters() {
        let source = source_with(6);

        let active = source
            .fetch_page(&page_request(None, 100, RecordFilter::ActiveOnly))
            .await
            .unwrap();
        assert_eq!(records_of(&active).0.len(), 3);

        let recent = source
            .fetch_page(&page_request(None, 100, RecordFilter::ModifiedSince(30)))
            .await
            .unwrap();
        assert_eq!(records_of(&recent).0.len(), 3);

        let mut request = page_request(None, 100, RecordFilter::All);
        request.keys = Some(vec![key("SKU001"), key("SKU999")]);
        request.fields = Some(vec!["status".into()]);
        let keyed = source.fetch_page(&request).await.unwrap();
        let (records, _) = records_of(&keyed);
        assert_eq!(records.len(), 1);
        assert!(records[0].get("quantity_on_hand").is_none());
        assert_eq!(records[0]["status"], "inactive");
    }

    #[tokio::test]
    async fn test_memory_source_report_is_ndjson() {
        let source = source_with(3);
        let response = source
            .fetch_report(&ReportRequest {
                kind: RecordKind::Item,
                filter: RecordFilter::All,
                fields: None,
            })
            .await
            .unwrap();
        assert_eq!(response.content_type.as_deref(), Some("application/x-ndjson"));

        let chunks: Vec<_> = response.body.collect().await;
        let body = String::from_utf8(chunks[0].as_ref().unwrap().to_vec()).unwrap();
        let lines: Vec<&str> = body.lines().collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(
            lines[0],
            r#"["last_modified","quantity_on_hand","sku","status"]"#
        );
    }

    #[tokio::test]
    async fn test_memory_source_empty_report_keeps_key_column() {
        let source = source_with(2);
        let response = source
            .fetch_report(&ReportRequest {
                kind: RecordKind::Vendor,
                filter: RecordFilter::All,
                fields: None,
            })
            .await
            .unwrap();
        let chunks: Vec<_> = response.body.collect().await;
        let body = String::from_utf8(chunks[0].as_ref().unwrap().to_vec()).unwrap();
        assert_eq!(body, "[\"vendor_id\"]\n");
    }

    #[tokio::test]
    async fn test_memory_source_bad_cursor_is_400() {
        let source = source_with(1);
        let response = source
            .fetch_page(&page_request(Some("abc"), 2, RecordFilter::All))
            .await
            .unwrap();
        assert_eq!(response.status, 400);
    }

    #[test]
    fn test_collection_paths() {
        assert_eq!(collection(RecordKind::Item), "items");
        assert_eq!(collection(RecordKind::Vendor), "vendors");
    }
}
