//! Injectable time source.
//!
//! Grounded on `spark-core::time::Clock`: the coordinator never calls
//! `std::time::Instant::now()` or `tokio::time::sleep` directly, so tests
//! can drive it under Tokio's paused/virtual clock (`#[tokio::test(start_paused
//! = true)]` + `tokio::time::advance`) instead of sleeping in real time.

use futures::future::BoxFuture;
use std::time::Duration;
use tokio::time::Instant;

/// A source of monotonic time, in fractional seconds since some fixed
/// origin, plus a sleep primitive.
///
/// `now()` must be monotonically non-decreasing for the ledger's binary
/// searches (spec.md invariants I1/I2) to remain meaningful.
pub trait Clock: Send + Sync + 'static {
    /// Current time, in seconds, relative to this clock's origin.
    fn now(&self) -> f64;

    /// A future that resolves no earlier than `duration` from now.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
}

/// The default [`Clock`], backed by Tokio's runtime clock.
///
/// Using `tokio::time::sleep`/`tokio::time::Instant` rather than
/// `std::time::Instant` means tests running under a paused Tokio clock
/// observe `SystemClock` advancing in lockstep with `tokio::time::advance`,
/// with no separate mock clock plumbing required.
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        self.origin.elapsed().as_secs_f64()
    }

    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }
}
