//! Test fixtures and helpers.
//!
//! Common setup code for engine tests: catalog records, a manual clock and a
//! fully wired engine over in-memory (or SQLite) storage.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use invsync::{Clock, EngineConfig, RetryPolicy, SyncEngine};
use invsync_core::{NaturalKey, RecordKind, RemoteRecord, Timestamp};
use invsync_remote::MemorySource;
use invsync_store::{MemoryStore, SqliteStore, Store};

use crate::faults::{FaultyStore, ScriptedSource};

/// 2024-01-01T00:00:00Z
pub const EPOCH: Timestamp = 1_704_067_200_000;

pub fn key(s: &str) -> NaturalKey {
    NaturalKey::new(s).expect("fixture keys are non-empty")
}

/// An active catalog item.
pub fn item(sku: &str, quantity: i64, reorder_point: i64) -> RemoteRecord {
    RemoteRecord::new(RecordKind::Item, key(sku))
        .with_field("quantity_on_hand", quantity)
        .with_field("reorder_point", reorder_point)
        .with_field("unit_cost", "4.25")
        .with_field("vendor_name", "Acme Supply")
        .with_field("status", "active")
}

/// An active vendor.
pub fn vendor(id: &str, name: &str) -> RemoteRecord {
    RemoteRecord::new(RecordKind::Vendor, key(id))
        .with_field("name", name)
        .with_field("status", "active")
}

/// A catalog of `items` items and `vendors` vendors.
///
/// Every fifth item sits at its reorder point, so it is critical once synced.
pub fn catalog(items: usize, vendors: usize) -> Arc<MemorySource> {
    let source = Arc::new(MemorySource::new());
    for i in 0..items {
        let quantity = if i % 5 == 0 { 10 } else { 100 };
        source.put(item(&format!("SKU-{:04}", i), quantity, 10).modified_at(EPOCH));
    }
    for i in 0..vendors {
        source.put(vendor(&format!("V-{:03}", i), &format!("Vendor {}", i)).modified_at(EPOCH));
    }
    source
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock(AtomicI64);

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self(AtomicI64::new(start))
    }

    pub fn advance(&self, by: Duration) {
        self.0.fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, at: Timestamp) {
        self.0.store(at, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> Timestamp {
        self.0.load(Ordering::SeqCst)
    }
}

/// A config with no real waiting: unthrottled, fast deterministic retries.
pub fn fast_config() -> EngineConfig {
    EngineConfig::default()
        .with_rate_limit(10_000, Duration::from_secs(1))
        .with_retry(RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            jitter: 0.0,
        })
}

/// A fully wired engine with handles on every collaborator.
pub struct TestEngine {
    pub catalog: Arc<MemorySource>,
    pub source: Arc<ScriptedSource>,
    pub store: Arc<FaultyStore>,
    pub clock: Arc<ManualClock>,
    pub engine: SyncEngine,
}

impl TestEngine {
    /// An engine over an empty catalog and an in-memory store.
    pub fn new() -> Self {
        Self::with(Arc::new(MemorySource::new()), Arc::new(MemoryStore::new()), fast_config())
    }

    pub fn with_catalog(catalog: Arc<MemorySource>) -> Self {
        Self::with(catalog, Arc::new(MemoryStore::new()), fast_config())
    }

    pub fn with_config(catalog: Arc<MemorySource>, config: EngineConfig) -> Self {
        Self::with(catalog, Arc::new(MemoryStore::new()), config)
    }

    /// An engine over a SQLite database file.
    pub fn sqlite(catalog: Arc<MemorySource>, path: &std::path::Path) -> Self {
        let store = SqliteStore::open(path).expect("open sqlite store");
        Self::with(catalog, Arc::new(store), fast_config())
    }

    pub fn with(catalog: Arc<MemorySource>, store: Arc<dyn Store>, config: EngineConfig) -> Self {
        let source = Arc::new(ScriptedSource::new(catalog.clone()));
        let store = Arc::new(FaultyStore::new(store));
        let clock = Arc::new(ManualClock::new(EPOCH));
        let engine = SyncEngine::new(store.clone(), source.clone(), config)
            .expect("valid engine config")
            .with_clock(clock.clone());
        Self {
            catalog,
            source,
            store,
            clock,
            engine,
        }
    }

    /// A second engine sharing this one's store, source and clock, as a
    /// separate process would.
    pub fn sibling(&self) -> SyncEngine {
        SyncEngine::new(self.store.clone(), self.source.clone(), self.engine.config().clone())
            .expect("valid engine config")
            .with_clock(self.clock.clone())
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_shape() {
        let source = catalog(10, 3);
        assert_eq!(source.len(RecordKind::Item), 10);
        assert_eq!(source.len(RecordKind::Vendor), 3);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new(EPOCH);
        clock.advance(Duration::from_secs(2));
        assert_eq!(clock.now_millis(), EPOCH + 2_000);
        clock.set(5);
        assert_eq!(clock.now_millis(), 5);
    }

    #[tokio::test]
    async fn test_engine_fixture_runs() {
        let fixture = TestEngine::with_catalog(catalog(3, 1));
        let run = fixture
            .engine
            .run_sync(invsync::SyncStrategy::Full, invsync::RunOptions::default())
            .await;
        assert_eq!(run.status, invsync::RunStatus::Succeeded);
        assert_eq!(run.counts.written, 4);
    }
}
