//! Simulation context implementing SyncContext for deterministic testing.

use async_trait::async_trait;
use goalsync_env::SyncContext;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Simulation context backed by deterministic time.
///
/// This implements `SyncContext` using:
/// - A virtual clock that can be advanced manually
/// - A per-peer wall-clock offset, to model peers whose clocks disagree
/// - Seeded ChaCha8 streams derived from the master seed
/// - Simulated sleep that advances virtual time
///
/// Clones share the virtual clock, so one `advance_time` moves every peer.
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Arc<Mutex<u64>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,

    /// Skew of this peer's wall clock against the shared one, in ms
    clock_offset_ms: i64,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(Mutex::new(0)),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
            clock_offset_ms: 0,
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Returns a context on the same virtual clock whose wall clock runs
    /// `offset_ms` ahead (negative: behind).
    pub fn with_offset_ms(&self, offset_ms: i64) -> Self {
        Self {
            clock_offset_ms: offset_ms,
            ..self.clone()
        }
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        let mut time = self.virtual_time_ns.lock().unwrap_or_else(PoisonError::into_inner);
        *time += duration.as_nanos() as u64;
    }

    /// Sets the virtual time to a specific value.
    pub fn set_time(&self, time_ns: u64) {
        let mut time = self.virtual_time_ns.lock().unwrap_or_else(PoisonError::into_inner);
        *time = time_ns;
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        *self.virtual_time_ns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Virtual milliseconds since simulation start (unskewed).
    pub fn elapsed_ms(&self) -> u64 {
        self.time_ns() / 1_000_000
    }

    pub fn clock_offset_ms(&self) -> i64 {
        self.clock_offset_ms
    }

    /// Derives an independent deterministic RNG stream from the master seed.
    ///
    /// Subsystems (relay faults, workload) take separate streams so that
    /// changing one does not perturb the other.
    pub fn derive_rng(&self, stream: u64) -> ChaCha8Rng {
        let combined_seed = self.seed.wrapping_mul(0x517cc1b727220a95) ^ stream;
        ChaCha8Rng::seed_from_u64(combined_seed)
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            epoch: self.epoch,
            clock_offset_ms: self.clock_offset_ms,
        }
    }
}

#[async_trait]
impl SyncContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        let base = self.epoch + self.now();
        let skew = Duration::from_millis(self.clock_offset_ms.unsigned_abs());
        if self.clock_offset_ms >= 0 {
            base + skew
        } else {
            base - skew
        }
    }

    async fn sleep(&self, duration: Duration) {
        // In simulation, sleep advances virtual time
        self.advance_time(duration);
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_sim_context_time() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.advance_time(Duration::from_secs(1));
        assert_eq!(ctx.now(), Duration::from_secs(1));

        ctx.advance_time(Duration::from_millis(500));
        assert_eq!(ctx.now(), Duration::from_millis(1500));
        assert_eq!(ctx.elapsed_ms(), 1500);
    }

    #[test]
    fn test_sim_context_wall_clock_ms() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now_ms(), 1_704_067_200_000);

        ctx.advance_time(Duration::from_millis(16));
        assert_eq!(ctx.now_ms(), 1_704_067_200_016);
    }

    #[test]
    fn test_sim_context_offset_shares_time() {
        let ctx = SimContext::new(42);
        let ahead = ctx.with_offset_ms(250);
        let behind = ctx.with_offset_ms(-250);

        ctx.advance_time(Duration::from_secs(1));

        assert_eq!(ahead.now(), ctx.now());
        assert_eq!(ahead.now_ms(), ctx.now_ms() + 250);
        assert_eq!(behind.now_ms(), ctx.now_ms() - 250);
    }

    #[test]
    fn test_sim_context_derived_rng_deterministic() {
        let a: u64 = SimContext::new(42).derive_rng(1).gen();
        let b: u64 = SimContext::new(42).derive_rng(1).gen();
        let c: u64 = SimContext::new(42).derive_rng(2).gen();

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_sim_context_seed() {
        let ctx = SimContext::new(12345);
        assert_eq!(ctx.seed(), 12345);
    }

    #[test]
    fn test_sim_context_clone_shares_time() {
        let ctx1 = SimContext::new(42);
        let ctx2 = ctx1.clone();

        ctx1.advance_time(Duration::from_secs(5));

        // Both should see the same time
        assert_eq!(ctx1.now(), ctx2.now());
    }

    #[tokio::test]
    async fn test_sim_sleep_advances_virtual_time() {
        let ctx = SimContext::new(1);
        ctx.sleep(Duration::from_millis(40)).await;
        assert_eq!(ctx.elapsed_ms(), 40);
    }
}
