//! Core environment context trait for LanePilot nodes.

use async_trait::async_trait;
use std::time::Duration;

/// The central interface for environment interaction.
///
/// Abstracts the "real world" (clock, sleeping, entropy) so that the
/// tracking, discovery and retry engines can run in production (tokio)
/// and in tests with a hand-driven clock.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, `OsRng`
/// - **Tests**: `ManualContext` - virtual clock advanced explicitly, seeded RNG
#[async_trait]
pub trait LanePilotContext: Send + Sync + 'static {
    /// Returns the monotonic time since context creation.
    ///
    /// The vehicle tracker timestamps every update with this value, so all
    /// speed and acceleration estimates are derived from it.
    fn now(&self) -> Duration;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In tests: advances the virtual clock
    async fn sleep(&self, duration: Duration);

    /// Fills `dest` with random bytes.
    ///
    /// Used for the 16-byte discovery challenge nonce.
    fn fill_random(&self, dest: &mut [u8]);
}
