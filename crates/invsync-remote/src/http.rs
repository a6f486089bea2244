//! HTTP implementation of [`RemoteSource`] using reqwest.
//!
//! Endpoints, relative to the configured base URL:
//!
//! - `GET /items`, `GET /vendors`: paginated JSON listings
//! - `GET /reports/items`, `GET /reports/vendors`: NDJSON bulk exports

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE, RETRY_AFTER};
use serde::{Deserialize, Serialize};

use invsync_core::RecordFilter;

use crate::error::{RemoteError, Result};
use crate::source::{collection, PageRequest, RawResponse, RemoteSource, ReportRequest, StreamResponse};

/// Connection settings for the remote inventory API.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub base_url: String,
    /// Bearer token. Usually supplied from the environment, not the config file.
    #[serde(skip_serializing)]
    pub api_token: Option<String>,
    /// Per-request timeout, in milliseconds.
    pub timeout_ms: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api/v1".to_string(),
            api_token: None,
            timeout_ms: 30_000,
        }
    }
}

/// Remote source backed by the HTTP API.
pub struct HttpSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSource {
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &config.api_token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| RemoteError::transport(format!("invalid API token: {}", e)))?;
            headers.insert(AUTHORIZATION, value);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()
            .map_err(|e| RemoteError::transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn get(&self, url: &str, query: &[(&'static str, String)]) -> Result<reqwest::Response> {
        self.client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(transport_error)
    }
}

fn transport_error(e: reqwest::Error) -> RemoteError {
    RemoteError::Transport {
        status: e.status().map(|s| s.as_u16()),
        message: if e.is_timeout() {
            format!("request timed out: {}", e)
        } else {
            e.to_string()
        },
    }
}

fn filter_query(filter: RecordFilter, query: &mut Vec<(&'static str, String)>) {
    match filter {
        RecordFilter::All => {}
        RecordFilter::ModifiedSince(ts) => query.push(("modified_since", ts.to_string())),
        RecordFilter::ActiveOnly => query.push(("active_only", "true".to_string())),
    }
}

/// Query parameters for a page request.
pub fn page_query(request: &PageRequest) -> Vec<(&'static str, String)> {
    let mut query = vec![("limit", request.limit.to_string())];
    if let Some(cursor) = &request.cursor {
        query.push(("cursor", cursor.clone()));
    }
    filter_query(request.filter, &mut query);
    if let Some(fields) = &request.fields {
        query.push(("fields", fields.join(",")));
    }
    if let Some(keys) = &request.keys {
        let keys: Vec<&str> = keys.iter().map(|k| k.as_str()).collect();
        query.push(("keys", keys.join(",")));
    }
    query
}

/// Query parameters for a report request.
pub fn report_query(request: &ReportRequest) -> Vec<(&'static str, String)> {
    let mut query = Vec::new();
    filter_query(request.filter, &mut query);
    if let Some(fields) = &request.fields {
        query.push(("fields", fields.join(",")));
    }
    query
}

/// `Retry-After` in delta-seconds. HTTP-date values are ignored.
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn response_meta(response: &reqwest::Response) -> (u16, Option<String>, Option<Duration>) {
    let headers = response.headers();
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let retry_after = headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_retry_after);
    (response.status().as_u16(), content_type, retry_after)
}

#[async_trait]
impl RemoteSource for HttpSource {
    async fn fetch_page(&self, request: &PageRequest) -> Result<RawResponse> {
        let url = self.url(collection(request.kind));
        let response = self.get(&url, &page_query(request)).await?;
        let (status, content_type, retry_after) = response_meta(&response);
        let body = response.bytes().await.map_err(transport_error)?;
        Ok(RawResponse {
            status,
            content_type,
            body,
            retry_after,
        })
    }

    async fn fetch_report(&self, request: &ReportRequest) -> Result<StreamResponse> {
        let url = self.url(&format!("reports/{}", collection(request.kind)));
        let response = self.get(&url, &report_query(request)).await?;
        let (status, content_type, retry_after) = response_meta(&response);
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(transport_error))
            .boxed();
        Ok(StreamResponse {
            status,
            content_type,
            body,
            retry_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use invsync_core::{NaturalKey, RecordKind};

    #[test]
    fn test_page_query() {
        let request = PageRequest {
            kind: RecordKind::Item,
            cursor: Some("c2".into()),
            limit: 50,
            filter: RecordFilter::ModifiedSince(1_700),
            fields: Some(vec!["quantity_on_hand".into(), "status".into()]),
            keys: Some(vec![NaturalKey::new("A1").unwrap(), NaturalKey::new("A2").unwrap()]),
        };
        assert_eq!(
            page_query(&request),
            vec![
                ("limit", "50".to_string()),
                ("cursor", "c2".to_string()),
                ("modified_since", "1700".to_string()),
                ("fields", "quantity_on_hand,status".to_string()),
                ("keys", "A1,A2".to_string()),
            ]
        );
    }

    #[test]
    fn test_report_query() {
        let request = ReportRequest {
            kind: RecordKind::Vendor,
            filter: RecordFilter::ActiveOnly,
            fields: None,
        };
        assert_eq!(report_query(&request), vec![("active_only", "true".to_string())]);
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after("30"), Some(Duration::from_secs(30)));
        assert_eq!(parse_retry_after(" 5 "), Some(Duration::from_secs(5)));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2015 07:28:00 GMT"), None);
    }

    #[test]
    fn test_base_url_is_normalized() {
        let source = HttpSource::new(&HttpConfig {
            base_url: "https://inventory.example.com/api/".into(),
            api_token: Some("secret".into()),
            timeout_ms: 1_000,
        })
        .unwrap();
        assert_eq!(source.url("items"), "https://inventory.example.com/api/items");
    }

    #[test]
    fn test_token_with_newline_is_rejected() {
        let result = HttpSource::new(&HttpConfig {
            api_token: Some("bad\ntoken".into()),
            ..HttpConfig::default()
        });
        assert!(result.is_err());
    }
}
