//! Fault injection for the remote source and the store.
//!
//! [`ScriptedSource`] wraps a [`MemorySource`] and answers selected requests
//! with scripted failures. [`FaultyStore`] wraps any [`Store`] and fails
//! upserts that touch selected keys. Both count what they injected.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{stream, StreamExt};

use invsync_core::{
    ConcurrencyLock, EntityWrite, KnownEntity, LockAcquisition, NaturalKey, ReconciledEntity,
    RecordKind, RunId, SyncRun, TierWatermarks, Timestamp,
};
use invsync_remote::{
    MemorySource, PageRequest, RawResponse, RemoteError, RemoteSource, ReportRequest,
    StreamResponse,
};
use invsync_store::{Store, StoreError};

/// A scripted failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Answer with this HTTP status.
    Status(u16),
    /// Answer 429 with an optional `Retry-After`.
    RateLimited(Option<Duration>),
    /// Answer 200 with this content type and body.
    Body { content_type: String, body: String },
    /// Fail below the HTTP layer.
    Unreachable,
    /// Reports only: send the header and `rows` rows, then break the stream.
    TruncateReport { rows: usize },
}

impl Fault {
    /// A 200 response whose body is not JSON.
    pub fn html() -> Self {
        Fault::Body {
            content_type: "text/html".to_string(),
            body: "<html><body>502 Bad Gateway</body></html>".to_string(),
        }
    }

    /// A 200 JSON response that is not a page.
    pub fn garbage_json() -> Self {
        Fault::Body {
            content_type: "application/json".to_string(),
            body: r#"{"records": 42"#.to_string(),
        }
    }
}

/// Which requests a fault applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Every listing page of a kind.
    Pages(RecordKind),
    /// The listing page at this cursor (`None` is the first page).
    Cursor(RecordKind, Option<String>),
    /// Any key-scoped request that includes this key.
    Key(RecordKind, NaturalKey),
    /// Bulk reports of a kind.
    Report(RecordKind),
}

impl Target {
    fn matches_page(&self, request: &PageRequest) -> bool {
        match self {
            Target::Pages(kind) => request.kind == *kind && request.keys.is_none(),
            Target::Cursor(kind, cursor) => {
                request.kind == *kind && request.keys.is_none() && request.cursor == *cursor
            }
            Target::Key(kind, key) => {
                request.kind == *kind && request.keys.as_ref().is_some_and(|keys| keys.contains(key))
            }
            Target::Report(_) => false,
        }
    }

    fn matches_report(&self, request: &ReportRequest) -> bool {
        matches!(self, Target::Report(kind) if *kind == request.kind)
    }
}

#[derive(Debug)]
struct Rule {
    target: Target,
    fault: Fault,
    /// Remaining injections; `None` is unlimited.
    remaining: Option<u32>,
}

/// A remote source that fails on cue.
pub struct ScriptedSource {
    inner: Arc<MemorySource>,
    rules: Mutex<Vec<Rule>>,
    injected: AtomicU64,
}

impl ScriptedSource {
    pub fn new(inner: Arc<MemorySource>) -> Self {
        Self {
            inner,
            rules: Mutex::new(Vec::new()),
            injected: AtomicU64::new(0),
        }
    }

    /// The wrapped catalog.
    pub fn catalog(&self) -> &Arc<MemorySource> {
        &self.inner
    }

    /// Inject `fault` on every matching request.
    pub fn fail(&self, target: Target, fault: Fault) {
        self.push(target, fault, None);
    }

    /// Inject `fault` on the next `times` matching requests.
    pub fn fail_times(&self, target: Target, fault: Fault, times: u32) {
        self.push(target, fault, Some(times));
    }

    /// Remove every rule.
    pub fn heal(&self) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.clear();
        }
    }

    /// Number of faults injected so far.
    pub fn injected(&self) -> u64 {
        self.injected.load(Ordering::SeqCst)
    }

    fn push(&self, target: Target, fault: Fault, remaining: Option<u32>) {
        if let Ok(mut rules) = self.rules.lock() {
            rules.push(Rule {
                target,
                fault,
                remaining,
            });
        }
    }

    fn take(&self, matches: impl Fn(&Target) -> bool) -> Option<Fault> {
        let mut rules = self.rules.lock().ok()?;
        let rule = rules
            .iter_mut()
            .find(|r| r.remaining != Some(0) && matches(&r.target))?;
        if let Some(n) = rule.remaining.as_mut() {
            *n -= 1;
        }
        self.injected.fetch_add(1, Ordering::SeqCst);
        Some(rule.fault.clone())
    }
}

fn respond(fault: &Fault) -> invsync_remote::Result<RawResponse> {
    match fault {
        Fault::Status(status) => Ok(RawResponse::status(*status, format!("injected {}", status))),
        Fault::RateLimited(hint) => Ok(RawResponse {
            retry_after: *hint,
            ..RawResponse::status(429, "slow down")
        }),
        Fault::Body { content_type, body } => Ok(RawResponse::ok(content_type, body.clone())),
        Fault::Unreachable | Fault::TruncateReport { .. } => {
            Err(RemoteError::transport("connection refused"))
        }
    }
}

#[async_trait]
impl RemoteSource for ScriptedSource {
    async fn fetch_page(&self, request: &PageRequest) -> invsync_remote::Result<RawResponse> {
        match self.take(|t| t.matches_page(request)) {
            Some(fault) => respond(&fault),
            None => self.inner.fetch_page(request).await,
        }
    }

    async fn fetch_report(&self, request: &ReportRequest) -> invsync_remote::Result<StreamResponse> {
        let Some(fault) = self.take(|t| t.matches_report(request)) else {
            return self.inner.fetch_report(request).await;
        };
        let rows = match fault {
            Fault::TruncateReport { rows } => rows,
            other => return respond(&other).map(StreamResponse::from_raw),
        };

        let mut full = self.inner.fetch_report(request).await?;
        let mut body = BytesMut::new();
        while let Some(chunk) = full.body.next().await {
            body.extend_from_slice(&chunk?);
        }
        let kept: Vec<&[u8]> = body[..].split(|b| *b == b'\n').take(rows + 1).collect();
        let mut prefix = kept.join(&b'\n');
        prefix.push(b'\n');

        let chunks: Vec<invsync_remote::Result<Bytes>> = vec![
            Ok(Bytes::from(prefix)),
            Err(RemoteError::transport("connection reset mid-report")),
        ];
        full.body = Box::pin(stream::iter(chunks));
        Ok(full)
    }
}

/// How an injected store failure presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFault {
    /// A constraint violation, classified `WriteConflict`.
    Conflict,
    /// A generic storage failure, classified `Store`.
    Unavailable,
}

/// A store that fails upserts touching selected keys.
pub struct FaultyStore {
    inner: Arc<dyn Store>,
    faults: Mutex<BTreeMap<(RecordKind, NaturalKey), (StoreFault, Option<u32>)>>,
    attempts: Mutex<BTreeMap<(RecordKind, NaturalKey), u32>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn Store>) -> Self {
        Self {
            inner,
            faults: Mutex::new(BTreeMap::new()),
            attempts: Mutex::new(BTreeMap::new()),
        }
    }

    /// Fail every upsert batch containing `key`, `times` times or forever.
    pub fn fail_upserts(&self, kind: RecordKind, key: NaturalKey, fault: StoreFault, times: Option<u32>) {
        if let Ok(mut faults) = self.faults.lock() {
            faults.insert((kind, key), (fault, times));
        }
    }

    /// Upsert attempts that included `key`, failed or not.
    pub fn upsert_attempts(&self, kind: RecordKind, key: &NaturalKey) -> u32 {
        self.attempts
            .lock()
            .ok()
            .and_then(|a| a.get(&(kind, key.clone())).copied())
            .unwrap_or(0)
    }

    fn check(&self, writes: &[EntityWrite]) -> invsync_store::Result<()> {
        let touched: BTreeSet<(RecordKind, NaturalKey)> =
            writes.iter().map(|w| (w.kind, w.key.clone())).collect();
        if let Ok(mut attempts) = self.attempts.lock() {
            for k in &touched {
                *attempts.entry(k.clone()).or_default() += 1;
            }
        }

        let mut faults = self
            .faults
            .lock()
            .map_err(|e| StoreError::InvalidData(e.to_string()))?;
        for k in &touched {
            let Some((fault, remaining)) = faults.get_mut(k) else {
                continue;
            };
            if *remaining == Some(0) {
                continue;
            }
            if let Some(n) = remaining.as_mut() {
                *n -= 1;
            }
            return Err(match fault {
                StoreFault::Conflict => StoreError::Conflict {
                    kind: k.0.to_string(),
                    key: k.1.to_string(),
                    reason: "injected constraint violation".to_string(),
                },
                StoreFault::Unavailable => StoreError::InvalidData("injected: database is locked".to_string()),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn get_known(
        &self,
        kind: RecordKind,
        keys: &[NaturalKey],
    ) -> invsync_store::Result<BTreeMap<NaturalKey, KnownEntity>> {
        self.inner.get_known(kind, keys).await
    }

    async fn get_entities(
        &self,
        kind: RecordKind,
        keys: &[NaturalKey],
    ) -> invsync_store::Result<BTreeMap<NaturalKey, ReconciledEntity>> {
        self.inner.get_entities(kind, keys).await
    }

    async fn get_entity(
        &self,
        kind: RecordKind,
        key: &NaturalKey,
    ) -> invsync_store::Result<Option<ReconciledEntity>> {
        self.inner.get_entity(kind, key).await
    }

    async fn list_entities(
        &self,
        kind: RecordKind,
        active_only: bool,
    ) -> invsync_store::Result<Vec<ReconciledEntity>> {
        self.inner.list_entities(kind, active_only).await
    }

    async fn upsert_entities(
        &self,
        writes: &[EntityWrite],
        run_id: RunId,
        now: Timestamp,
    ) -> invsync_store::Result<usize> {
        self.check(writes)?;
        self.inner.upsert_entities(writes, run_id, now).await
    }

    async fn deactivate_absent(
        &self,
        kind: RecordKind,
        seen: &BTreeSet<NaturalKey>,
        run_id: RunId,
        now: Timestamp,
    ) -> invsync_store::Result<Vec<NaturalKey>> {
        self.inner.deactivate_absent(kind, seen, run_id, now).await
    }

    async fn active_keys(&self, kind: RecordKind) -> invsync_store::Result<BTreeSet<NaturalKey>> {
        self.inner.active_keys(kind).await
    }

    async fn critical_keys(&self) -> invsync_store::Result<BTreeSet<NaturalKey>> {
        self.inner.critical_keys().await
    }

    async fn try_acquire_lock(
        &self,
        run_id: RunId,
        now: Timestamp,
        stale_after_ms: i64,
    ) -> invsync_store::Result<LockAcquisition> {
        self.inner.try_acquire_lock(run_id, now, stale_after_ms).await
    }

    async fn heartbeat_lock(&self, run_id: RunId, now: Timestamp) -> invsync_store::Result<bool> {
        self.inner.heartbeat_lock(run_id, now).await
    }

    async fn release_lock(&self, run_id: RunId) -> invsync_store::Result<bool> {
        self.inner.release_lock(run_id).await
    }

    async fn current_lock(&self) -> invsync_store::Result<Option<ConcurrencyLock>> {
        self.inner.current_lock().await
    }

    async fn insert_run(&self, run: &SyncRun) -> invsync_store::Result<()> {
        self.inner.insert_run(run).await
    }

    async fn update_run(&self, run: &SyncRun) -> invsync_store::Result<()> {
        self.inner.update_run(run).await
    }

    async fn get_run(&self, id: RunId) -> invsync_store::Result<Option<SyncRun>> {
        self.inner.get_run(id).await
    }

    async fn list_runs(&self, limit: usize) -> invsync_store::Result<Vec<SyncRun>> {
        self.inner.list_runs(limit).await
    }

    async fn mark_run_stuck(&self, id: RunId, now: Timestamp) -> invsync_store::Result<bool> {
        self.inner.mark_run_stuck(id, now).await
    }

    async fn tier_watermarks(&self) -> invsync_store::Result<TierWatermarks> {
        self.inner.tier_watermarks().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::item;
    use invsync_core::RecordFilter;

    fn page(kind: RecordKind, keys: Option<Vec<NaturalKey>>) -> PageRequest {
        PageRequest {
            kind,
            cursor: None,
            limit: 10,
            filter: RecordFilter::All,
            fields: None,
            keys,
        }
    }

    #[tokio::test]
    async fn test_fault_applies_limited_times() {
        let catalog = Arc::new(MemorySource::new());
        catalog.put(item("A1", 5, 1));
        let source = ScriptedSource::new(catalog);
        source.fail_times(Target::Pages(RecordKind::Item), Fault::Status(503), 2);

        let request = page(RecordKind::Item, None);
        assert_eq!(source.fetch_page(&request).await.unwrap().status, 503);
        assert_eq!(source.fetch_page(&request).await.unwrap().status, 503);
        assert_eq!(source.fetch_page(&request).await.unwrap().status, 200);
        assert_eq!(source.injected(), 2);

        // Vendor pages are untouched.
        assert_eq!(source.fetch_page(&page(RecordKind::Vendor, None)).await.unwrap().status, 200);
    }

    #[tokio::test]
    async fn test_key_fault_only_hits_requests_with_key() {
        let source = ScriptedSource::new(Arc::new(MemorySource::new()));
        let b7 = NaturalKey::new("B7").unwrap();
        source.fail(Target::Key(RecordKind::Item, b7.clone()), Fault::Unreachable);

        let other = page(RecordKind::Item, Some(vec![NaturalKey::new("A1").unwrap()]));
        assert!(source.fetch_page(&other).await.is_ok());
        assert!(source.fetch_page(&page(RecordKind::Item, Some(vec![b7]))).await.is_err());
        assert!(source.fetch_page(&page(RecordKind::Item, None)).await.is_ok());
    }

    #[tokio::test]
    async fn test_truncated_report_breaks_after_rows() {
        let catalog = Arc::new(MemorySource::new());
        for i in 0..5 {
            catalog.put(item(&format!("A{}", i), 5, 1));
        }
        let source = ScriptedSource::new(catalog);
        source.fail(Target::Report(RecordKind::Item), Fault::TruncateReport { rows: 2 });

        let request = ReportRequest {
            kind: RecordKind::Item,
            filter: RecordFilter::All,
            fields: None,
        };
        let mut response = source.fetch_report(&request).await.unwrap();
        let first = response.body.next().await.unwrap().unwrap();
        assert_eq!(first.iter().filter(|b| **b == b'\n').count(), 3);
        assert!(response.body.next().await.unwrap().is_err());
    }

    #[tokio::test]
    async fn test_faulty_store_fails_selected_keys() {
        let store = FaultyStore::new(Arc::new(invsync_store::MemoryStore::new()));
        let key = NaturalKey::new("B7").unwrap();
        store.fail_upserts(RecordKind::Item, key.clone(), StoreFault::Conflict, Some(1));

        let write = EntityWrite::from_record(&item("B7", 1, 1), invsync_core::Fingerprint::from_bytes([1; 32]));
        let err = store.upsert_entities(std::slice::from_ref(&write), RunId::generate(), 1).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.upsert_entities(&[write], RunId::generate(), 1).await.unwrap(), 1);
        assert_eq!(store.upsert_attempts(RecordKind::Item, &key), 2);
    }
}
