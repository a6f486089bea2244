//! # invsync Core
//!
//! Pure primitives for the inventory sync engine: remote records, material
//! fingerprints, change detection, strategy resolution and the run model.
//!
//! This crate contains no I/O, no storage, no networking. It is pure computation
//! over catalog records.
//!
//! ## Key Types
//!
//! - [`RemoteRecord`] - A catalog item or vendor as read from the remote source
//! - [`Fingerprint`] - Blake3 digest over the material fields of a record
//! - [`ChangeDetector`] - Decides whether a record must be written
//! - [`SyncStrategy`] / [`SyncScope`] - What a run considers, and how
//! - [`SyncRun`] - The durable record of one engine run
//!
//! ## Canonicalization
//!
//! Material fields are normalized and encoded using deterministic CBOR before
//! hashing. See the [`canonical`] module.

pub mod canonical;
pub mod detector;
pub mod entity;
pub mod error;
pub mod fingerprint;
pub mod lock;
pub mod record;
pub mod run;
pub mod strategy;
pub mod types;

pub use detector::{ChangeDetector, WriteDecision};
pub use entity::{EntityWrite, KnownEntity, ReconciledEntity};
pub use error::{CoreError, Result};
pub use fingerprint::{FieldProjection, Fingerprint, ProjectionSet, DEFAULT_PROJECTION_VERSION};
pub use lock::{ConcurrencyLock, LockAcquisition};
pub use record::{normalize_value, NormalizedValue, RemoteRecord};
pub use run::{BatchFailure, ErrorClass, ListingFailure, RunCounts, RunStatus, SyncRun};
pub use strategy::{
    resolve, select_smart, FieldScope, RecordFilter, ScopeSource, SmartThresholds,
    StrategyContext, SyncScope, SyncStrategy, SyncTier, TierWatermarks, INVENTORY_FIELDS,
};
pub use types::{NaturalKey, RecordKind, RunId, Timestamp};
