//! # invsync Store
//!
//! Storage abstraction for the local reconciled store. Provides a trait-based
//! interface with SQLite and in-memory implementations.
//!
//! ## Overview
//!
//! The store holds three things:
//!
//! - **Entities** - one row per `(kind, natural key)` with fields, fingerprint
//!   and soft-delete flag
//! - **The lock** - a singleton row that guarantees at most one run system-wide
//! - **The sync log** - one row per run, immutable once terminal
//!
//! ## Key Types
//!
//! - [`Store`] - The async trait for all storage operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//!
//! ## Usage
//!
//! ```rust,no_run
//! use invsync_store::{SqliteStore, Store};
//! use invsync_core::RecordKind;
//!
//! async fn example() -> invsync_store::Result<()> {
//!     // Open a SQLite database
//!     let store = SqliteStore::open("invsync.db")?;
//!
//!     // Or use an in-memory database for testing
//!     let store = SqliteStore::open_memory()?;
//!
//!     let critical = store.critical_keys().await?;
//!     let items = store.list_entities(RecordKind::Item, true).await?;
//!     println!("{} active items, {} at reorder point", items.len(), critical.len());
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::Store;
