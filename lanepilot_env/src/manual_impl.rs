//! Hand-driven context for deterministic tests.

use crate::LanePilotContext;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Context backed by a virtual clock and a seeded RNG.
///
/// - The clock only moves when `advance_time` or `sleep` is called
/// - Nonces are reproducible for a given seed
/// - Clones share the same clock
pub struct ManualContext {
    /// Current virtual time (nanoseconds since creation)
    virtual_time_ns: Arc<Mutex<u64>>,

    /// Deterministic RNG for nonces
    rng: Arc<Mutex<StdRng>>,
}

impl ManualContext {
    /// Creates a new ManualContext with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            virtual_time_ns: Arc::new(Mutex::new(0)),
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        let mut time = self
            .virtual_time_ns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *time += duration.as_nanos() as u64;
    }
}

impl Clone for ManualContext {
    fn clone(&self) -> Self {
        Self {
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            rng: Arc::clone(&self.rng),
        }
    }
}

#[async_trait]
impl LanePilotContext for ManualContext {
    fn now(&self) -> Duration {
        let time = self
            .virtual_time_ns
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        Duration::from_nanos(*time)
    }

    async fn sleep(&self, duration: Duration) {
        self.advance_time(duration);
        tokio::task::yield_now().await;
    }

    fn fill_random(&self, dest: &mut [u8]) {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        rng.fill_bytes(dest);
    }
}
