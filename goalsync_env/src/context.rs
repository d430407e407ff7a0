//! Core environment context trait for GoalSync clients.

use async_trait::async_trait;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The central interface for environment interaction.
///
/// Abstracts the clock so that the same client code runs against the wall
/// clock in production and a virtual clock in simulation.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and `SystemTime`
/// - **Simulation**: `SimContext` - manually advanced virtual clock
///
/// # Clock skew
///
/// Due timestamps written by one peer are compared against `now_ms()` on
/// another. Peers are assumed to have roughly synchronized wall clocks; no
/// skew correction is applied.
#[async_trait]
pub trait SyncContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    ///
    /// Used for frame deltas. In simulation, this is the virtual clock time.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time.
    ///
    /// In simulation, this is derived from virtual clock + epoch offset.
    fn system_time(&self) -> SystemTime;

    /// Wall-clock milliseconds since the Unix epoch.
    ///
    /// This is the unit of every `due` timestamp on the wire.
    fn now_ms(&self) -> u64 {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances virtual clock
    async fn sleep(&self, duration: Duration);

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}
