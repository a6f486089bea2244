//! # invsync testkit
//!
//! Testing utilities for the inventory sync engine.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: catalogs, a manual clock and a fully wired [`TestEngine`]
//! - **Faults**: scripted remote failures and failing store writes
//! - **Generators**: proptest strategies for records in any remote spelling
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use invsync::{RunOptions, RunStatus, SyncStrategy};
//! use invsync_testkit::faults::{Fault, Target};
//! use invsync_testkit::fixtures::{catalog, TestEngine};
//!
//! # async fn example() {
//! let fixture = TestEngine::with_catalog(catalog(20, 2));
//! fixture.source.fail(Target::Pages(invsync::RecordKind::Vendor), Fault::Status(503));
//!
//! let run = fixture.engine.run_sync(SyncStrategy::Full, RunOptions::default()).await;
//! assert_eq!(run.status, RunStatus::PartialFailure);
//! # }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use invsync_testkit::generators::item_record;
//!
//! proptest! {
//!     #[test]
//!     fn fingerprint_is_deterministic(record in item_record()) {
//!         // ...
//!     }
//! }
//! ```

pub mod faults;
pub mod fixtures;
pub mod generators;

pub use faults::{Fault, FaultyStore, ScriptedSource, StoreFault, Target};
pub use fixtures::{catalog, fast_config, ManualClock, TestEngine, EPOCH};
pub use generators::{item_batch, item_record, ItemParams};
