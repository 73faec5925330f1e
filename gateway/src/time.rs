//! Time source abstraction.
//!
//! Token expiry is measured against a `TimeSource` so production code reads
//! the system clock while tests drive a `SimulatedTimeSource` forward
//! explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Abstraction over time operations.
///
/// Implementations must be shareable across tasks: the token sweep runs on a
/// background task while request handlers validate tokens concurrently.
pub trait TimeSource: Send + Sync {
    /// Get the current time in milliseconds since Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Real time source using the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    #[allow(clippy::cast_possible_truncation)] // Milliseconds won't overflow u64 for billions of years
    fn now_ms(&self) -> u64 {
        // duration_since(UNIX_EPOCH) only fails if system time is before 1970.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |duration| duration.as_millis() as u64)
    }
}

/// A simulated time source for deterministic testing.
///
/// Time only advances when told to. Backed by an atomic so it can be shared
/// with the background sweep task.
///
/// # Example
///
/// ```
/// use gateway::time::{SimulatedTimeSource, TimeSource};
///
/// let time = SimulatedTimeSource::new(1000);
/// assert_eq!(time.now_ms(), 1000);
///
/// time.advance(100);
/// assert_eq!(time.now_ms(), 1100);
/// ```
#[derive(Debug)]
pub struct SimulatedTimeSource {
    current_time_ms: AtomicU64,
}

impl SimulatedTimeSource {
    /// Create a new simulated time source with the given initial time.
    #[must_use]
    pub const fn new(initial_time_ms: u64) -> Self {
        Self {
            current_time_ms: AtomicU64::new(initial_time_ms),
        }
    }

    /// Create a simulated time source starting at `1_700_000_000_000`
    /// (approximately November 2023).
    #[must_use]
    pub const fn default_start() -> Self {
        Self::new(1_700_000_000_000)
    }

    /// Advance time by the given number of milliseconds.
    ///
    /// Time saturates at `u64::MAX` if overflow would occur.
    pub fn advance(&self, ms: u64) {
        let _ = self
            .current_time_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(current.saturating_add(ms))
            });
    }
}

impl TimeSource for SimulatedTimeSource {
    fn now_ms(&self) -> u64 {
        self.current_time_ms.load(Ordering::SeqCst)
    }
}

impl Default for SimulatedTimeSource {
    fn default() -> Self {
        Self::default_start()
    }
}
