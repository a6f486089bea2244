//! Wall-clock abstraction.
//!
//! Lock heartbeats, run timestamps and smart-strategy staleness all read the
//! time through a [`Clock`], so tests can drive them deterministically.

use std::time::{SystemTime, UNIX_EPOCH};

use invsync_core::Timestamp;

/// A source of Unix-millisecond timestamps.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> Timestamp;
}

/// The system wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as Timestamp)
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_is_recent() {
        // 2020-01-01T00:00:00Z
        assert!(SystemClock.now_millis() > 1_577_836_800_000);
    }
}
