//! Injected wall-clock source.
//!
//! Every read of wall time in the engine goes through [`Clock`] so that
//! scheduling, lease expiry, and retry timing are deterministic under test.
//! Production code uses [`SystemClock`]; tests use the manual clock from the
//! `testing` module.

use std::sync::Arc;

use chrono::{DateTime, Utc};

/// Source of wall time for scheduling, timeouts, and heartbeats.
pub trait Clock: Send + Sync + 'static {
    /// The current instant.
    fn now(&self) -> DateTime<Utc>;
}

/// Shared handle to a clock implementation.
pub type SharedClock = Arc<dyn Clock>;

/// Clock backed by the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Convert a std duration into a chrono delta, saturating instead of failing.
pub(crate) fn to_delta(duration: std::time::Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_clock_advances() {
        let clock = SystemClock;
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_to_delta_roundtrip() {
        let delta = to_delta(std::time::Duration::from_millis(1500));
        assert_eq!(delta.num_milliseconds(), 1500);
    }

    #[test]
    fn test_to_delta_saturates() {
        let delta = to_delta(std::time::Duration::MAX);
        assert_eq!(delta, chrono::Duration::MAX);
    }
}
