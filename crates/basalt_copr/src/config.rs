//! Runtime knobs for the dispatcher.

use std::time::Duration;

use serde::Deserialize;

/// Tuning for one batch coprocessor client.
///
/// The backoff ceilings bound how long task construction and per-worker
/// stream recovery may sleep in total; the read timeout is the single-RPC
/// deadline handed to the sender for one streaming round trip.
#[derive(Clone, Copy, Debug, Deserialize)]
pub struct CoprConfig {
    /// Total backoff budget while building batch tasks.
    pub max_build_backoff: Duration,
    /// Total backoff budget for one worker across send/recv retries.
    pub max_next_backoff: Duration,
    /// Deadline for a single streaming round trip. Analytical scans can run
    /// for a very long time, so this is intentionally generous.
    pub read_timeout_ultra_long: Duration,
}

impl Default for CoprConfig {
    fn default() -> Self {
        Self {
            max_build_backoff: Duration::from_secs(5),
            max_next_backoff: Duration::from_secs(20),
            read_timeout_ultra_long: Duration::from_secs(3600),
        }
    }
}
