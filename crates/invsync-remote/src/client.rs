//! Rate-limited, classifying client over a [`RemoteSource`].

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use invsync_core::{NaturalKey, RecordFilter, RecordKind};

use crate::decode::{self, decode_page, decode_report, snippet, DumpItem, KeyFields, Page};
use crate::error::{RemoteError, Result};
use crate::rate_limit::RateLimiter;
use crate::source::{BodyStream, PageRequest, RemoteSource, ReportRequest};

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Records requested per page.
    pub page_size: usize,
    /// 429 responses absorbed per call before giving up with `RateLimited`.
    pub max_rate_limit_waits: u32,
    /// Wait after a 429 without a server hint; doubles per consecutive 429.
    pub rate_limit_backoff: Duration,
    /// Upper bound on any single 429 wait.
    pub max_rate_limit_backoff: Duration,
    pub key_fields: KeyFields,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_rate_limit_waits: 5,
            rate_limit_backoff: Duration::from_secs(1),
            max_rate_limit_backoff: Duration::from_secs(60),
            key_fields: KeyFields::default(),
        }
    }
}

/// Reads the remote catalog through the shared rate limiter.
///
/// Every call waits for an admission first. Status codes are classified:
///
/// | Status | Result |
/// |--------|--------|
/// | 2xx | decoded (after content-type validation) |
/// | 401, 403 | `Auth` |
/// | 429 | pause the limiter, retry (bounded) |
/// | 408, 5xx | `Transport` |
/// | other | `Malformed` |
#[derive(Clone)]
pub struct RemoteClient {
    source: Arc<dyn RemoteSource>,
    limiter: Arc<RateLimiter>,
    config: ClientConfig,
}

/// Map a non-2xx response to its error. `Ok` carries the wait hint of a 429.
fn classify_failure(
    status: u16,
    retry_after: Option<Duration>,
    body: &[u8],
) -> std::result::Result<Option<Duration>, RemoteError> {
    match status {
        429 => Ok(retry_after),
        401 | 403 => Err(RemoteError::Auth {
            status,
            message: snippet(body),
        }),
        408 | 500..=599 => Err(RemoteError::Transport {
            status: Some(status),
            message: format!("HTTP {}: {}", status, snippet(body)),
        }),
        _ => Err(RemoteError::malformed(
            format!("unexpected HTTP {}", status),
            snippet(body),
        )),
    }
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// The first chunk of a streamed body, enough for a diagnostic snippet.
async fn first_chunk(body: &mut BodyStream) -> Bytes {
    match body.next().await {
        Some(Ok(chunk)) => chunk,
        _ => Bytes::new(),
    }
}

impl RemoteClient {
    pub fn new(source: Arc<dyn RemoteSource>, limiter: Arc<RateLimiter>, config: ClientConfig) -> Self {
        Self {
            source,
            limiter,
            config,
        }
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Fetch one page of a listing.
    pub async fn fetch_page(
        &self,
        kind: RecordKind,
        cursor: Option<&str>,
        filter: RecordFilter,
        fields: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> Result<Page> {
        let request = PageRequest {
            kind,
            cursor: cursor.map(str::to_string),
            limit: self.config.page_size,
            filter,
            fields: fields.map(<[String]>::to_vec),
            keys: None,
        };
        self.request_page(&request, cancel).await
    }

    /// Fetch the given keys, following cursors until the listing ends.
    ///
    /// Keys the remote does not return are simply absent from the result.
    pub async fn fetch_keys(
        &self,
        kind: RecordKind,
        keys: &[NaturalKey],
        fields: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> Result<Page> {
        let mut out = Page::default();
        if keys.is_empty() {
            return Ok(out);
        }

        let mut request = PageRequest {
            kind,
            cursor: None,
            limit: self.config.page_size,
            filter: RecordFilter::All,
            fields: fields.map(<[String]>::to_vec),
            keys: Some(keys.to_vec()),
        };
        loop {
            let page = self.request_page(&request, cancel).await?;
            out.records.extend(page.records);
            out.malformed.extend(page.malformed);
            match page.next_cursor {
                Some(next) if request.cursor.as_deref() != Some(next.as_str()) => {
                    request.cursor = Some(next)
                }
                Some(next) => {
                    return Err(RemoteError::malformed(
                        format!("cursor {} did not advance", next),
                        snippet(next.as_bytes()),
                    ))
                }
                None => return Ok(out),
            }
        }
    }

    /// Start a bulk report export and stream its rows.
    ///
    /// The stream is lazy: rows are decoded as the body arrives, so memory
    /// stays bounded regardless of catalog size.
    pub async fn fetch_full_dump(
        &self,
        kind: RecordKind,
        filter: RecordFilter,
        fields: Option<&[String]>,
        cancel: &CancellationToken,
    ) -> Result<BoxStream<'static, Result<DumpItem>>> {
        let request = ReportRequest {
            kind,
            filter,
            fields: fields.map(<[String]>::to_vec),
        };

        let mut waits = 0u32;
        loop {
            self.limiter.acquire_cancellable(cancel).await?;
            let mut response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RemoteError::Cancelled),
                r = self.source.fetch_report(&request) => r?,
            };

            if is_success(response.status) {
                if !decode::is_ndjson(response.content_type.as_deref()) {
                    let head = first_chunk(&mut response.body).await;
                    return Err(RemoteError::malformed(
                        format!(
                            "expected NDJSON report, got {}",
                            response.content_type.as_deref().unwrap_or("no content type")
                        ),
                        snippet(&head),
                    ));
                }
                return Ok(decode_report(
                    kind,
                    self.config.key_fields.for_kind(kind),
                    response.body,
                    cancel.clone(),
                ));
            }

            let head = first_chunk(&mut response.body).await;
            let hint = classify_failure(response.status, response.retry_after, &head)?;
            self.throttled(kind, hint, &mut waits)?;
        }
    }

    async fn request_page(&self, request: &PageRequest, cancel: &CancellationToken) -> Result<Page> {
        let mut waits = 0u32;
        loop {
            self.limiter.acquire_cancellable(cancel).await?;
            let raw = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(RemoteError::Cancelled),
                r = self.source.fetch_page(request) => r?,
            };

            if !is_success(raw.status) {
                let hint = classify_failure(raw.status, raw.retry_after, &raw.body)?;
                self.throttled(request.kind, hint, &mut waits)?;
                continue;
            }

            if !decode::is_json(raw.content_type.as_deref()) {
                return Err(RemoteError::malformed(
                    format!(
                        "expected JSON page, got {}",
                        raw.content_type.as_deref().unwrap_or("no content type")
                    ),
                    snippet(&raw.body),
                ));
            }
            let page = decode_page(
                request.kind,
                self.config.key_fields.for_kind(request.kind),
                &raw.body,
            )?;
            if !page.malformed.is_empty() {
                warn!(
                    kind = %request.kind,
                    malformed = page.malformed.len(),
                    "page contained malformed records"
                );
            }
            return Ok(page);
        }
    }

    /// Record one 429: pause the shared limiter, or give up after too many.
    fn throttled(&self, kind: RecordKind, hint: Option<Duration>, waits: &mut u32) -> Result<()> {
        *waits += 1;
        if *waits > self.config.max_rate_limit_waits {
            return Err(RemoteError::RateLimited { retry_after: hint });
        }
        let backoff = self
            .config
            .rate_limit_backoff
            .saturating_mul(1u32 << (*waits - 1).min(16));
        let delay = hint.unwrap_or(backoff).min(self.config.max_rate_limit_backoff);
        debug!(
            kind = %kind,
            wait = *waits,
            delay_ms = delay.as_millis() as u64,
            "remote rate limited, pausing"
        );
        self.limiter.pause_for(delay);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::RateLimitConfig;
    use crate::source::memory::MemorySource;
    use crate::source::{RawResponse, StreamResponse};
    use async_trait::async_trait;
    use invsync_core::RemoteRecord;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::time::Instant;

    fn key(s: &str) -> NaturalKey {
        NaturalKey::new(s).unwrap()
    }

    /// Answers from a script first, then from an inner catalog.
    struct Scripted {
        script: Mutex<VecDeque<RawResponse>>,
        inner: MemorySource,
    }

    impl Scripted {
        fn new(script: Vec<RawResponse>) -> Self {
            let inner = MemorySource::new();
            inner.put(RemoteRecord::new(RecordKind::Item, key("A1")).with_field("quantity_on_hand", 1));
            Self {
                script: Mutex::new(script.into()),
                inner,
            }
        }
    }

    #[async_trait]
    impl RemoteSource for Scripted {
        async fn fetch_page(&self, request: &PageRequest) -> Result<RawResponse> {
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(raw) => Ok(raw),
                None => self.inner.fetch_page(request).await,
            }
        }

        async fn fetch_report(&self, request: &ReportRequest) -> Result<StreamResponse> {
            let next = self.script.lock().unwrap().pop_front();
            match next {
                Some(raw) => Ok(StreamResponse::from_raw(raw)),
                None => self.inner.fetch_report(request).await,
            }
        }
    }

    fn client(source: impl RemoteSource + 'static, config: ClientConfig) -> RemoteClient {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            max_requests: 100,
            per: Duration::from_secs(1),
        }));
        RemoteClient::new(Arc::new(source), limiter, config)
    }

    fn too_many(hint: Option<u64>) -> RawResponse {
        let mut raw = RawResponse::status(429, "slow down");
        raw.retry_after = hint.map(Duration::from_secs);
        raw
    }

    async fn first_page(client: &RemoteClient) -> Result<Page> {
        client
            .fetch_page(RecordKind::Item, None, RecordFilter::All, None, &CancellationToken::new())
            .await
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_honors_retry_after() {
        let client = client(Scripted::new(vec![too_many(Some(7))]), ClientConfig::default());
        let start = Instant::now();

        let page = first_page(&client).await.unwrap();

        assert_eq!(page.records.len(), 1);
        assert_eq!(start.elapsed(), Duration::from_secs(7));
        assert_eq!(client.limiter().admitted(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_429_without_hint_backs_off_exponentially() {
        let client = client(
            Scripted::new(vec![too_many(None), too_many(None)]),
            ClientConfig::default(),
        );
        let start = Instant::now();
        first_page(&client).await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_secs(1 + 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_429_becomes_rate_limited() {
        let config = ClientConfig {
            max_rate_limit_waits: 2,
            ..ClientConfig::default()
        };
        let client = client(
            Scripted::new(vec![too_many(Some(1)), too_many(Some(1)), too_many(Some(4))]),
            config,
        );
        let err = first_page(&client).await.unwrap_err();
        assert_eq!(err.retry_after(), Some(Duration::from_secs(4)));
    }

    #[tokio::test]
    async fn test_status_classification() {
        for (status, expect_auth, expect_transport) in
            [(401, true, false), (403, true, false), (503, false, true), (408, false, true)]
        {
            let client = client(
                Scripted::new(vec![RawResponse::status(status, "nope")]),
                ClientConfig::default(),
            );
            let err = first_page(&client).await.unwrap_err();
            assert_eq!(err.is_fatal(), expect_auth, "status {}", status);
            assert_eq!(
                matches!(err, RemoteError::Transport { .. }),
                expect_transport,
                "status {}",
                status
            );
        }

        let client = client(
            Scripted::new(vec![RawResponse::status(404, "gone")]),
            ClientConfig::default(),
        );
        assert!(matches!(
            first_page(&client).await.unwrap_err(),
            RemoteError::Malformed { .. }
        ));
    }

    #[tokio::test]
    async fn test_wrong_content_type_is_malformed() {
        let client = client(
            Scripted::new(vec![RawResponse::ok("text/html", "<html>maintenance</html>")]),
            ClientConfig::default(),
        );
        match first_page(&client).await.unwrap_err() {
            RemoteError::Malformed { snippet, .. } => assert!(snippet.contains("maintenance")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fetch_keys_follows_cursors() {
        let source = MemorySource::new();
        for i in 0..5 {
            source.put(RemoteRecord::new(RecordKind::Item, key(&format!("K{}", i))));
        }
        let config = ClientConfig {
            page_size: 1,
            ..ClientConfig::default()
        };
        let client = client(source, config);

        let keys = vec![key("K1"), key("K3"), key("MISSING")];
        let page = client
            .fetch_keys(RecordKind::Item, &keys, None, &CancellationToken::new())
            .await
            .unwrap();
        let got: Vec<&str> = page.records.iter().map(|r| r.key.as_str()).collect();
        assert_eq!(got, vec!["K1", "K3"]);
    }

    #[tokio::test]
    async fn test_full_dump_streams_rows() {
        let source = MemorySource::new();
        for i in 0..3 {
            source.put(RemoteRecord::new(RecordKind::Item, key(&format!("R{}", i))).with_field("status", "active"));
        }
        let client = client(source, ClientConfig::default());
        let stream = client
            .fetch_full_dump(RecordKind::Item, RecordFilter::All, None, &CancellationToken::new())
            .await
            .unwrap();
        let items: Vec<_> = stream.collect().await;
        assert_eq!(items.len(), 3);
        assert!(items.iter().all(|i| matches!(i, Ok(DumpItem::Record(_)))));
    }

    #[tokio::test]
    async fn test_full_dump_rejects_json_body() {
        let client = client(
            Scripted::new(vec![RawResponse::ok("application/json", "{}")]),
            ClientConfig::default(),
        );
        let result = client
            .fetch_full_dump(RecordKind::Item, RecordFilter::All, None, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(RemoteError::Malformed { .. })));
    }

    #[tokio::test]
    async fn test_full_dump_wrong_content_type_keeps_snippet() {
        let client = client(
            Scripted::new(vec![RawResponse::ok("text/html", "<html>502 Bad Gateway</html>")]),
            ClientConfig::default(),
        );
        let result = client
            .fetch_full_dump(RecordKind::Item, RecordFilter::All, None, &CancellationToken::new())
            .await;
        match result {
            Err(RemoteError::Malformed { message, snippet }) => {
                assert!(message.contains("text/html"));
                assert_eq!(snippet, "<html>502 Bad Gateway</html>");
            }
            Err(other) => panic!("unexpected {:?}", other),
            Ok(_) => panic!("expected a malformed report"),
        }
    }

    #[tokio::test]
    async fn test_fetch_keys_stuck_cursor_names_cursor() {
        let stuck = r#"{"records": [], "next_cursor": "c-17"}"#;
        let client = client(
            Scripted::new(vec![
                RawResponse::ok("application/json", stuck),
                RawResponse::ok("application/json", stuck),
            ]),
            ClientConfig::default(),
        );
        let err = client
            .fetch_keys(RecordKind::Item, &[key("A1")], None, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            RemoteError::Malformed { message, snippet } => {
                assert!(message.contains("did not advance"));
                assert_eq!(snippet, "c-17");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancelled_before_request() {
        let source = MemorySource::new();
        let client = client(source, ClientConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client
            .fetch_page(RecordKind::Item, None, RecordFilter::All, None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Cancelled));
    }
}
