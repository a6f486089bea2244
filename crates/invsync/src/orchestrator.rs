//! The sync engine: one entry point that runs a reconciliation end to end.
//!
//! A run moves through `Acquiring → Running → Finalizing` and always ends in a
//! terminal [`SyncRun`]:
//!
//! - `Skipped` when another run holds the lock
//! - `Succeeded` / `PartialFailure` when the scope was worked through
//! - `Aborted` on an auth error, cancellation, a deadline or a lost lock
//! - `Failed` on any other run-level error, including a panic in the run body
//!
//! Every path that acquired the lock writes the final log entry and releases
//! the lock before returning.

use std::collections::BTreeSet;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::{FutureExt, StreamExt};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};

use invsync_core::{
    BatchFailure, ChangeDetector, ConcurrencyLock, ErrorClass, FieldScope, LockAcquisition,
    ListingFailure, NaturalKey, ProjectionSet, RecordFilter, RecordKind, RemoteRecord, RunId,
    RunStatus, ScopeSource, StrategyContext, SyncRun, SyncScope, SyncStrategy, SyncTier, Timestamp,
};
use invsync_remote::{DumpItem, MalformedItem, RateLimiter, RemoteClient, RemoteError, RemoteSource};
use invsync_store::Store;

use crate::batch::{BatchOutcome, BatchProcessor, Exhausted};
use crate::cache::SnapshotCache;
use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::error::{Classify, EngineError, Result};
use crate::guard::ConcurrencyGuard;
use crate::reconcile::{Decision, Reconciler};
use crate::sync_log::{Health, SyncLog};

/// Options for a single run.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Compute decisions without writing entities.
    pub dry_run: bool,
    /// Abort the run once this much time has passed.
    pub deadline: Option<Duration>,
    /// External cancellation.
    pub cancel: Option<CancellationToken>,
}

impl RunOptions {
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            ..Self::default()
        }
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }
}

/// Phase of the run in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Acquiring,
    Running,
    Finalizing,
}

/// What this engine instance is doing.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineStatus {
    Idle,
    Active { phase: Phase, run: SyncRun },
}

/// What a run works through.
#[derive(Debug, Clone)]
enum RunPlan {
    Strategy(SyncStrategy),
    Redrive(SyncScope),
}

/// Per-batch tallies of a key-scoped fetch.
#[derive(Debug, Default)]
struct KeyBatchStats {
    fetched: u64,
    changed: u64,
    written: u64,
    malformed: Vec<MalformedItem>,
}

/// How a listing ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Listing {
    /// Every page was read; absent keys may be deactivated.
    Complete,
    /// Some part of the listing is unknown.
    Incomplete,
}

/// The inventory sync engine.
#[derive(Clone)]
pub struct SyncEngine {
    store: Arc<dyn Store>,
    client: RemoteClient,
    reconciler: Reconciler,
    guard: ConcurrencyGuard,
    log: SyncLog,
    clock: Arc<dyn Clock>,
    config: Arc<EngineConfig>,
    active: Arc<Mutex<Option<(Phase, SyncRun)>>>,
}

impl SyncEngine {
    /// Build an engine over a store and a remote source.
    pub fn new(
        store: Arc<dyn Store>,
        source: Arc<dyn RemoteSource>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;

        let limiter = Arc::new(RateLimiter::new(config.rate_limit.to_limiter_config()));
        let client = RemoteClient::new(source, limiter, config.client.to_client_config());
        let detector = ChangeDetector::new(ProjectionSet::with_version(config.projection_version.0));
        let reconciler = Reconciler::new(store.clone(), detector);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let guard = ConcurrencyGuard::new(store.clone(), clock.clone(), config.guard.clone());

        Ok(Self {
            log: SyncLog::new(store.clone()),
            store,
            client,
            reconciler,
            guard,
            clock,
            config: Arc::new(config),
            active: Arc::new(Mutex::new(None)),
        })
    }

    /// Read time from `clock` instead of the system clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.guard = ConcurrencyGuard::new(self.store.clone(), clock.clone(), self.config.guard.clone());
        self.clock = clock;
        self
    }

    /// Write reconciled entities through to `cache`.
    pub fn with_cache(mut self, cache: Arc<dyn SnapshotCache>) -> Self {
        self.reconciler = self.reconciler.with_cache(cache);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Entry Points
    // ─────────────────────────────────────────────────────────────────────────

    /// Run one sync. Never fails: every outcome is a terminal [`SyncRun`].
    pub async fn run_sync(&self, strategy: SyncStrategy, options: RunOptions) -> SyncRun {
        let run = SyncRun::new(RunId::generate(), Some(strategy), options.dry_run, self.clock.now_millis());
        self.execute(run, RunPlan::Strategy(strategy), options).await
    }

    /// Re-run the keys that failed in an earlier run as a targeted run.
    pub async fn redrive(&self, run_id: RunId, options: RunOptions) -> Result<SyncRun> {
        let previous = self
            .log
            .get(run_id)
            .await?
            .ok_or(EngineError::RunNotFound(run_id))?;
        let keys = previous.failed_keys();
        if keys.is_empty() {
            return Err(EngineError::NothingToRedrive(run_id));
        }

        let mut run = SyncRun::new(RunId::generate(), None, options.dry_run, self.clock.now_millis());
        run.redrive_of = Some(run_id);
        let count: usize = keys.values().map(BTreeSet::len).sum();
        info!(run_id = %run.id, redrive_of = %run_id, keys = count, "re-driving failed keys");
        Ok(self.execute(run, RunPlan::Redrive(SyncScope::targeted(keys)), options).await)
    }

    /// The run this engine instance is executing, if any.
    pub fn status(&self) -> EngineStatus {
        match self.active.lock().ok().and_then(|slot| slot.clone()) {
            Some((phase, run)) => EngineStatus::Active { phase, run },
            None => EngineStatus::Idle,
        }
    }

    /// The store-wide lock, which may be held by another process.
    pub async fn current_lock(&self) -> Result<Option<ConcurrencyLock>> {
        Ok(self.store.current_lock().await?)
    }

    /// Most recent runs, newest first.
    pub async fn history(&self, limit: usize) -> Result<Vec<SyncRun>> {
        self.log.history(limit).await
    }

    pub async fn health(&self) -> Result<Health> {
        self.log.health().await
    }

    /// Repopulate the snapshot cache from the store.
    pub async fn rebuild_cache(&self) -> Result<usize> {
        let entries = self.reconciler.rebuild_cache().await?;
        info!(entries, "snapshot cache rebuilt");
        Ok(entries)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Run Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    async fn execute(&self, run: SyncRun, plan: RunPlan, options: RunOptions) -> SyncRun {
        let span = info_span!(
            "sync_run",
            run_id = %run.id,
            tier = tracing::field::Empty,
            dry_run = run.dry_run
        );
        self.execute_inner(run, plan, options).instrument(span).await
    }

    async fn execute_inner(&self, mut run: SyncRun, plan: RunPlan, options: RunOptions) -> SyncRun {
        self.set_active(Phase::Acquiring, &run);
        let cancel = options
            .cancel
            .as_ref()
            .map(CancellationToken::child_token)
            .unwrap_or_default();

        match self.guard.acquire(run.id, &cancel).await {
            Ok(LockAcquisition::Contended { holder }) => {
                info!(holder = %holder.holder, "another run holds the lock; skipping");
                let reason = format!("lock held by run {}", holder.holder);
                return self.finish_unlocked(run, RunStatus::Skipped, reason).await;
            }
            Ok(_) => {}
            Err(EngineError::Cancelled) => {
                return self.finish_unlocked(run, RunStatus::Aborted, "cancelled while waiting for the lock".into()).await;
            }
            Err(e) => {
                error!(error = %e, "lock acquisition failed");
                return self.finish_unlocked(run, RunStatus::Failed, e.to_string()).await;
            }
        }

        run.status = RunStatus::Running;
        if let Err(e) = self.log.start(&run).await {
            error!(error = %e, "could not record run start");
            run.finish(RunStatus::Failed, self.clock.now_millis(), Some(e.to_string()));
            self.release(run.id).await;
            self.clear_active(run.id);
            return run;
        }
        self.set_active(Phase::Running, &run);

        let heartbeat = self.guard.spawn_heartbeat(run.id, cancel.clone());
        let deadline_hit = Arc::new(AtomicBool::new(false));
        let deadline = options
            .deadline
            .map(|after| spawn_deadline(after, cancel.clone(), deadline_hit.clone()));

        let body = AssertUnwindSafe(self.run_body(&mut run, &plan, &cancel))
            .catch_unwind()
            .await;

        if let Some(task) = deadline {
            task.abort();
        }
        let lock_lost = heartbeat.stop().await;
        let deadline_hit = deadline_hit.load(Ordering::Acquire);
        let run_id = run.id;
        let abort_reason = || {
            if lock_lost {
                EngineError::LockLost(run_id).to_string()
            } else if deadline_hit {
                "deadline exceeded".to_string()
            } else {
                "cancelled".to_string()
            }
        };

        let (status, reason) = match body {
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                error!(panic = %message, "run panicked");
                (RunStatus::Failed, Some(format!("panic: {}", message)))
            }
            Ok(Err(e)) if lock_lost || matches!(e.class(), ErrorClass::Cancelled) => {
                (RunStatus::Aborted, Some(abort_reason()))
            }
            Ok(Err(e)) if e.class() == ErrorClass::Auth => {
                error!(error = %e, "authentication failed; run aborted");
                (RunStatus::Aborted, Some(e.to_string()))
            }
            Ok(Err(e)) => {
                error!(error = %e, "run failed");
                (RunStatus::Failed, Some(e.to_string()))
            }
            Ok(Ok(())) if lock_lost || cancel.is_cancelled() => (RunStatus::Aborted, Some(abort_reason())),
            Ok(Ok(())) => (run.completion_status(), None),
        };

        self.set_active(Phase::Finalizing, &run);
        run.finish(status, self.clock.now_millis(), reason);
        if let Err(e) = self.log.finish(&run).await {
            // A reclaimed run was already marked stuck by its successor.
            warn!(error = %e, "could not record run outcome");
        }
        if !lock_lost {
            self.release(run.id).await;
        }
        self.clear_active(run.id);
        log_outcome(&run);
        run
    }

    /// Record a run that never held the lock.
    async fn finish_unlocked(&self, mut run: SyncRun, status: RunStatus, reason: String) -> SyncRun {
        run.finish(status, self.clock.now_millis(), Some(reason));
        if let Err(e) = self.log.start(&run).await {
            warn!(error = %e, "could not record run outcome");
        }
        self.clear_active(run.id);
        log_outcome(&run);
        run
    }

    async fn release(&self, run_id: RunId) {
        if let Err(e) = self.guard.release(run_id).await {
            warn!(error = %e, "lock release failed; it will go stale");
        }
    }

    fn set_active(&self, phase: Phase, run: &SyncRun) {
        if let Ok(mut slot) = self.active.lock() {
            match slot.as_ref() {
                Some((_, current)) if current.id != run.id => {}
                _ => *slot = Some((phase, run.clone())),
            }
        }
    }

    fn clear_active(&self, run_id: RunId) {
        if let Ok(mut slot) = self.active.lock() {
            if slot.as_ref().is_some_and(|(_, run)| run.id == run_id) {
                *slot = None;
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Run Body
    // ─────────────────────────────────────────────────────────────────────────

    async fn run_body(&self, run: &mut SyncRun, plan: &RunPlan, cancel: &CancellationToken) -> Result<()> {
        let scope = self.resolve_scope(plan).await?;
        run.tier = Some(scope.tier);
        Span::current().record("tier", scope.tier.as_str());
        info!(
            strategy = run.strategy.map(|s| s.as_str()).unwrap_or("redrive"),
            tier = %scope.tier,
            kinds = scope.kinds.len(),
            "run started"
        );
        self.log.update(run).await?;

        let batch = BatchProcessor::new(self.config.batch.retry.clone(), cancel.clone());
        for &kind in &scope.kinds {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match &scope.source {
                ScopeSource::Listing { filter } => {
                    self.sync_listing(run, &scope, kind, *filter, &batch, cancel).await?
                }
                ScopeSource::Keys(map) => {
                    let keys: Vec<NaturalKey> = map
                        .get(&kind)
                        .map(|set| set.iter().cloned().collect())
                        .unwrap_or_default();
                    self.sync_keys(run, kind, keys, &scope.fields, &batch, cancel).await?
                }
            }
            self.log.update(run).await?;
            self.set_active(Phase::Running, run);
        }
        Ok(())
    }

    async fn resolve_scope(&self, plan: &RunPlan) -> Result<SyncScope> {
        let strategy = match plan {
            RunPlan::Redrive(scope) => return Ok(scope.clone()),
            RunPlan::Strategy(strategy) => *strategy,
        };

        let mut ctx = StrategyContext {
            now: self.clock.now_millis(),
            watermarks: self.store.tier_watermarks().await?,
            thresholds: self.config.smart.thresholds(),
            critical_keys: BTreeSet::new(),
        };
        let tier = strategy.tier(ctx.now, &ctx.watermarks, &ctx.thresholds);
        if tier == SyncTier::CriticalOnly {
            ctx.critical_keys = self.store.critical_keys().await?;
        }
        debug!(strategy = %strategy, tier = %tier, watermarks = ?ctx.watermarks, "strategy resolved");
        Ok(SyncScope::for_tier(tier, &ctx))
    }

    /// Work through a listing of one kind, then deactivate what it did not report.
    async fn sync_listing(
        &self,
        run: &mut SyncRun,
        scope: &SyncScope,
        kind: RecordKind,
        filter: RecordFilter,
        batch: &BatchProcessor,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut seen = BTreeSet::new();
        let listing = if self.config.full_via_report && scope.tier == SyncTier::Full {
            self.read_report(run, kind, filter, &scope.fields, &mut seen, batch, cancel).await?
        } else {
            self.read_pages(run, kind, filter, &scope.fields, &mut seen, batch, cancel).await?
        };

        let deactivated = self
            .reconciler
            .deactivate_absent(
                kind,
                &seen,
                scope,
                listing == Listing::Complete,
                run.id,
                self.clock.now_millis(),
                run.dry_run,
            )
            .await?;
        if !deactivated.is_empty() {
            info!(kind = %kind, count = deactivated.len(), "deactivated entities absent from listing");
        }
        run.counts.deactivated += deactivated.len() as u64;
        Ok(())
    }

    /// Page through a listing. Each page is fully written before the next is read.
    #[allow(clippy::too_many_arguments)]
    async fn read_pages(
        &self,
        run: &mut SyncRun,
        kind: RecordKind,
        filter: RecordFilter,
        fields: &FieldScope,
        seen: &mut BTreeSet<NaturalKey>,
        batch: &BatchProcessor,
        cancel: &CancellationToken,
    ) -> Result<Listing> {
        let mut cursor: Option<String> = None;
        let mut listing = Listing::Complete;
        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let fetched = batch
                .with_retry(|| self.client.fetch_page(kind, cursor.as_deref(), filter, fields.names(), cancel))
                .await;
            let page = match fetched {
                Ok(page) => page,
                Err(exhausted) => {
                    self.listing_failed(run, kind, cursor.clone(), exhausted, cancel)?;
                    return Ok(Listing::Incomplete);
                }
            };
            debug!(
                kind = %kind,
                cursor = cursor.as_deref().unwrap_or(""),
                records = page.records.len(),
                malformed = page.malformed.len(),
                "page fetched"
            );

            if !record_malformed(run, &page.malformed, seen) {
                listing = Listing::Incomplete;
            }
            run.counts.fetched += page.records.len() as u64;
            seen.extend(page.records.iter().map(|r| r.key.clone()));
            self.reconcile(run, kind, page.records, fields, batch).await?;

            match page.next_cursor {
                Some(next) if cursor.as_deref() != Some(next.as_str()) => cursor = Some(next),
                Some(next) => {
                    warn!(kind = %kind, cursor = %next, "cursor did not advance; listing incomplete");
                    run.listing_failures.push(ListingFailure {
                        kind,
                        cursor: Some(next),
                        class: ErrorClass::Malformed,
                        attempts: 1,
                        message: "cursor did not advance".to_string(),
                    });
                    return Ok(Listing::Incomplete);
                }
                None => return Ok(listing),
            }
        }
    }

    /// Stream a bulk report, reconciling it in page-sized chunks.
    #[allow(clippy::too_many_arguments)]
    async fn read_report(
        &self,
        run: &mut SyncRun,
        kind: RecordKind,
        filter: RecordFilter,
        fields: &FieldScope,
        seen: &mut BTreeSet<NaturalKey>,
        batch: &BatchProcessor,
        cancel: &CancellationToken,
    ) -> Result<Listing> {
        let stream = match batch
            .with_retry(|| self.client.fetch_full_dump(kind, filter, fields.names(), cancel))
            .await
        {
            Ok(stream) => stream,
            Err(exhausted) => {
                self.listing_failed(run, kind, None, exhausted, cancel)?;
                return Ok(Listing::Incomplete);
            }
        };

        let mut listing = Listing::Complete;
        let mut chunks = stream.chunks(self.client.config().page_size.max(1));
        while let Some(items) = chunks.next().await {
            let mut records = Vec::with_capacity(items.len());
            let mut malformed = Vec::new();
            let mut broken: Option<RemoteError> = None;
            for item in items {
                match item {
                    Ok(DumpItem::Record(record)) => records.push(record),
                    Ok(DumpItem::Malformed(item)) => malformed.push(item),
                    Err(e) => {
                        broken = Some(e);
                        break;
                    }
                }
            }

            if !record_malformed(run, &malformed, seen) {
                listing = Listing::Incomplete;
            }
            run.counts.fetched += records.len() as u64;
            seen.extend(records.iter().map(|r| r.key.clone()));
            self.reconcile(run, kind, records, fields, batch).await?;

            if let Some(error) = broken {
                // A report cannot be resumed mid-stream.
                self.listing_failed(run, kind, None, Exhausted { error, attempts: 1 }, cancel)?;
                return Ok(Listing::Incomplete);
            }
        }
        Ok(listing)
    }

    /// Record an unreadable part of a listing, or escalate if the run must stop.
    fn listing_failed(
        &self,
        run: &mut SyncRun,
        kind: RecordKind,
        cursor: Option<String>,
        exhausted: Exhausted<RemoteError>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let Exhausted { error, attempts } = exhausted;
        let class = error.class();
        if class == ErrorClass::Auth {
            return Err(error.into());
        }
        if class == ErrorClass::Cancelled || cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let message = error.detail();
        warn!(
            kind = %kind,
            cursor = cursor.as_deref().unwrap_or(""),
            class = %class,
            attempts,
            error = %message,
            "listing read failed; listing incomplete"
        );
        run.listing_failures.push(ListingFailure {
            kind,
            cursor,
            class,
            attempts,
            message,
        });
        Ok(())
    }

    /// Plan one page of records and write the changed ones in batches.
    async fn reconcile(
        &self,
        run: &mut SyncRun,
        kind: RecordKind,
        records: Vec<RemoteRecord>,
        fields: &FieldScope,
        batch: &BatchProcessor,
    ) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let decisions = batch
            .with_retry(|| self.reconciler.plan(kind, records.clone(), fields))
            .await
            .map_err(|exhausted| exhausted.error)?;
        let changed: Vec<Decision> = decisions.into_iter().filter(|d| d.write).collect();
        run.counts.changed += changed.len() as u64;
        if changed.is_empty() {
            return Ok(());
        }

        let (run_id, dry_run, now) = (run.id, run.dry_run, self.clock.now_millis());
        let reconciler = &self.reconciler;
        let outcome = batch
            .run(
                changed,
                self.config.batch.batch_size,
                self.config.batch.max_concurrency,
                |decisions: Vec<Decision>| async move {
                    reconciler.apply(&decisions, run_id, now, dry_run).await
                },
            )
            .await;

        let written = absorb(run, kind, outcome, |d: &Decision| d.key().clone())?;
        run.counts.written += written.into_iter().sum::<usize>() as u64;
        Ok(())
    }

    /// Fetch, plan and write an explicit key set in batches.
    async fn sync_keys(
        &self,
        run: &mut SyncRun,
        kind: RecordKind,
        keys: Vec<NaturalKey>,
        fields: &FieldScope,
        batch: &BatchProcessor,
        cancel: &CancellationToken,
    ) -> Result<()> {
        if keys.is_empty() {
            info!(kind = %kind, "no keys in scope");
            return Ok(());
        }

        let (run_id, dry_run, now) = (run.id, run.dry_run, self.clock.now_millis());
        let outcome = batch
            .run(
                keys,
                self.config.batch.batch_size,
                self.config.batch.max_concurrency,
                |keys: Vec<NaturalKey>| async move {
                    self.sync_key_batch(kind, keys, fields, run_id, now, dry_run, cancel).await
                },
            )
            .await;

        let mut seen = BTreeSet::new();
        for stats in absorb(run, kind, outcome, NaturalKey::clone)? {
            run.counts.fetched += stats.fetched;
            run.counts.changed += stats.changed;
            run.counts.written += stats.written;
            record_malformed(run, &stats.malformed, &mut seen);
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn sync_key_batch(
        &self,
        kind: RecordKind,
        keys: Vec<NaturalKey>,
        fields: &FieldScope,
        run_id: RunId,
        now: Timestamp,
        dry_run: bool,
        cancel: &CancellationToken,
    ) -> Result<KeyBatchStats> {
        let mut page = self.client.fetch_keys(kind, &keys, fields.names(), cancel).await?;
        let wanted: BTreeSet<&NaturalKey> = keys.iter().collect();
        page.records.retain(|r| wanted.contains(&r.key));
        if page.records.len() < keys.len() {
            debug!(kind = %kind, requested = keys.len(), returned = page.records.len(), "remote omitted keys");
        }

        let fetched = page.records.len() as u64;
        let decisions = self.reconciler.plan(kind, page.records, fields).await?;
        let changed = decisions.iter().filter(|d| d.write).count() as u64;
        let written = self.reconciler.apply(&decisions, run_id, now, dry_run).await? as u64;
        Ok(KeyBatchStats {
            fetched,
            changed,
            written,
            malformed: page.malformed,
        })
    }
}

/// Fold a batch outcome into the run. Returns the results of completed batches.
fn absorb<I, T, E>(
    run: &mut SyncRun,
    kind: RecordKind,
    outcome: BatchOutcome<I, T, E>,
    key_of: impl Fn(&I) -> NaturalKey,
) -> Result<Vec<T>>
where
    EngineError: From<E>,
{
    for failed in &outcome.failed {
        run.counts.failed += failed.items.len() as u64;
        run.failures.extend(failed.items.iter().map(|item| BatchFailure {
            kind,
            key: key_of(item),
            class: failed.class,
            attempts: failed.attempts,
            message: failed.message.clone(),
        }));
    }
    if let Some(fatal) = outcome.fatal {
        return Err(fatal.into());
    }
    if outcome.cancelled || !outcome.not_started.is_empty() {
        return Err(EngineError::Cancelled);
    }
    Ok(outcome.completed)
}

/// Count and log malformed items. Readable keys are added to `seen` so they
/// are never deactivated. Returns `false` if some item had no readable key.
fn record_malformed(run: &mut SyncRun, items: &[MalformedItem], seen: &mut BTreeSet<NaturalKey>) -> bool {
    let mut all_keyed = true;
    for item in items {
        warn!(
            kind = %item.kind,
            index = item.index,
            key = item.key.as_deref().unwrap_or(""),
            reason = %item.reason,
            raw = %item.raw,
            "skipping malformed record"
        );
        match item.key.as_deref().map(NaturalKey::new) {
            Some(Ok(key)) => {
                seen.insert(key);
            }
            _ => all_keyed = false,
        }
    }
    run.counts.malformed += items.len() as u64;
    all_keyed
}

fn spawn_deadline(after: Duration, cancel: CancellationToken, hit: Arc<AtomicBool>) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = tokio::time::sleep(after) => {
                warn!(deadline_ms = after.as_millis() as u64, "deadline exceeded; cancelling run");
                hit.store(true, Ordering::Release);
                cancel.cancel();
            }
        }
    })
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn log_outcome(run: &SyncRun) {
    let c = &run.counts;
    match run.status {
        RunStatus::Succeeded | RunStatus::Skipped => info!(
            status = %run.status,
            fetched = c.fetched,
            changed = c.changed,
            written = c.written,
            deactivated = c.deactivated,
            duration_ms = run.duration_ms().unwrap_or(0),
            "run finished"
        ),
        _ => warn!(
            status = %run.status,
            fetched = c.fetched,
            changed = c.changed,
            written = c.written,
            failed = c.failed,
            malformed = c.malformed,
            listing_failures = run.listing_failures.len(),
            error = run.error.as_deref().unwrap_or(""),
            "run finished"
        ),
    }
}
