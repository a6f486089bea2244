//! # invsync Remote
//!
//! Read access to the remote inventory catalog.
//!
//! ## Layers
//!
//! - [`RemoteSource`] - Raw reads (HTTP via [`HttpSource`], or in-memory via
//!   [`MemorySource`]). Returns undecoded responses.
//! - [`RateLimiter`] - Shared rolling-window limiter. Every remote call waits
//!   for an admission; 429 hints pause it for all callers.
//! - [`RemoteClient`] - Classifies statuses into [`RemoteError`] variants,
//!   validates content types and decodes pages and reports.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use invsync_core::{RecordFilter, RecordKind};
//! use invsync_remote::{ClientConfig, HttpConfig, HttpSource, RateLimiter, RemoteClient};
//! use tokio_util::sync::CancellationToken;
//!
//! async fn example() -> invsync_remote::Result<()> {
//!     let source = HttpSource::new(&HttpConfig::default())?;
//!     let client = RemoteClient::new(
//!         Arc::new(source),
//!         Arc::new(RateLimiter::default()),
//!         ClientConfig::default(),
//!     );
//!
//!     let cancel = CancellationToken::new();
//!     let page = client
//!         .fetch_page(RecordKind::Item, None, RecordFilter::All, None, &cancel)
//!         .await?;
//!     println!("{} records, next cursor {:?}", page.records.len(), page.next_cursor);
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod decode;
pub mod error;
pub mod http;
pub mod rate_limit;
pub mod source;

pub use client::{ClientConfig, RemoteClient};
pub use decode::{DumpItem, KeyFields, MalformedItem, Page};
pub use error::{RemoteError, Result};
pub use http::{HttpConfig, HttpSource};
pub use rate_limit::{RateLimitConfig, RateLimiter};
pub use source::memory::MemorySource;
pub use source::{PageRequest, RawResponse, RemoteSource, ReportRequest, StreamResponse};
