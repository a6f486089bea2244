//! Tracing setup for binaries embedding the engine.

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber writing to stderr.
///
/// The filter comes from `RUST_LOG` and defaults to `info`:
///
/// ```bash
/// RUST_LOG=invsync=debug invsync run --strategy full
/// RUST_LOG=invsync_remote=trace,info invsync run
/// ```
///
/// Calling it twice is harmless; the second call leaves the first
/// subscriber in place.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
