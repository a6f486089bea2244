//! # invsync
//!
//! The inventory sync engine: strategy-driven, rate-limited, idempotent
//! reconciliation of a remote catalog into a local store.
//!
//! ## Overview
//!
//! One call to [`SyncEngine::run_sync`] does the whole job:
//!
//! - **Guard**: take the store-wide lock, or report the run as `Skipped`
//! - **Resolve**: turn the requested strategy into a concrete scope
//! - **Fetch**: read pages (or a bulk report) through the rate limiter
//! - **Detect**: fingerprint material fields and keep only real changes
//! - **Write**: upsert changes in bounded, retried batches
//! - **Log**: record the terminal outcome in the sync log
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use invsync::{EngineConfig, RunOptions, SyncEngine};
//! use invsync::core::SyncStrategy;
//! use invsync::remote::{HttpConfig, HttpSource};
//! use invsync::store::SqliteStore;
//!
//! async fn example() -> invsync::Result<()> {
//!     let config = EngineConfig::load("invsync.toml")?;
//!     let store = Arc::new(SqliteStore::open("invsync.db")?);
//!     let source = Arc::new(HttpSource::new(&config.http)?);
//!
//!     let engine = SyncEngine::new(store, source, config)?;
//!     let run = engine.run_sync(SyncStrategy::Smart, RunOptions::default()).await;
//!     println!("{} finished as {}", run.id, run.status);
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `invsync::core` - Records, fingerprints, strategies and the run model
//! - `invsync::store` - Storage abstraction and SQLite
//! - `invsync::remote` - Remote source, rate limiter and client

pub mod batch;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod guard;
pub mod logging;
pub mod orchestrator;
pub mod reconcile;
pub mod schedule;
pub mod sync_log;

// Re-export component crates
pub use invsync_core as core;
pub use invsync_remote as remote;
pub use invsync_store as store;

// Re-export main types for convenience
pub use batch::{BatchOutcome, BatchProcessor, RetryPolicy};
pub use cache::{MemorySnapshotCache, SnapshotCache};
pub use clock::{Clock, SystemClock};
pub use config::{ContentionMode, EngineConfig, MAX_BATCH_SIZE};
pub use error::{ConfigError, EngineError, Result};
pub use guard::ConcurrencyGuard;
pub use orchestrator::{EngineStatus, Phase, RunOptions, SyncEngine};
pub use reconcile::{Decision, Reconciler};
pub use schedule::Scheduler;
pub use sync_log::{Health, SyncLog};

// Re-export commonly used core types
pub use invsync_core::{
    ErrorClass, NaturalKey, RecordKind, RemoteRecord, RunId, RunStatus, SyncRun, SyncStrategy,
    SyncTier,
};
