//! Per-request retry pacing and latency attribution.
//!
//! A `Backoffer` is owned by exactly one caller (the build loop, or one
//! worker) and never shared. It paces retries with equal-jitter exponential
//! sleeps per reason and keeps the per-reason totals that the response
//! adapter snapshots into runtime stats.

use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;

use crate::error::CoprError;

/// Doubling cap: one reason's delay stops growing after this many retries.
const BACKOFF_MAX_SHIFT: u32 = 6;

/// Why a retry slept. Each reason has its own base delay and ceiling.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum BackoffReason {
    /// The region cache snapshot was stale; the region map is being reloaded.
    RegionMiss,
    /// A store RPC or stream receive failed.
    StoreRpc,
}

impl BackoffReason {
    fn base(self) -> Duration {
        match self {
            BackoffReason::RegionMiss => Duration::from_millis(2),
            BackoffReason::StoreRpc => Duration::from_millis(100),
        }
    }

    fn cap(self) -> Duration {
        match self {
            BackoffReason::RegionMiss => Duration::from_millis(500),
            BackoffReason::StoreRpc => Duration::from_millis(2000),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackoffReason::RegionMiss => "region_miss",
            BackoffReason::StoreRpc => "store_rpc",
        }
    }
}

impl std::fmt::Display for BackoffReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Accumulator of retry sleeps for one request, bounded by a total ceiling.
#[derive(Debug)]
pub struct Backoffer {
    max_sleep: Duration,
    total_sleep: Duration,
    sleep_by_reason: BTreeMap<BackoffReason, Duration>,
    times_by_reason: BTreeMap<BackoffReason, u32>,
}

impl Backoffer {
    pub fn new(max_sleep: Duration) -> Self {
        Self {
            max_sleep,
            total_sleep: Duration::ZERO,
            sleep_by_reason: BTreeMap::new(),
            times_by_reason: BTreeMap::new(),
        }
    }

    /// Sleep once for `reason`. Fails with `BackoffExhausted` wrapping
    /// `cause` when the next sleep would push the total over the ceiling.
    pub async fn backoff(&mut self, reason: BackoffReason, cause: CoprError) -> Result<(), CoprError> {
        let attempts = self.times_by_reason.entry(reason).or_insert(0);
        let shift = (*attempts).min(BACKOFF_MAX_SHIFT);
        let full = reason
            .base()
            .saturating_mul(1u32 << shift)
            .min(reason.cap());
        // Equal jitter: half fixed, half uniform random.
        let half = full / 2;
        let jitter_ms = rand::thread_rng().gen_range(0..=half.as_millis().max(1) as u64);
        let sleep = half + Duration::from_millis(jitter_ms);

        if self.total_sleep + sleep > self.max_sleep {
            return Err(CoprError::BackoffExhausted {
                reason,
                cause: Box::new(cause),
            });
        }

        *attempts += 1;
        tracing::debug!(
            reason = reason.as_str(),
            sleep_ms = sleep.as_millis() as u64,
            total_ms = (self.total_sleep + sleep).as_millis() as u64,
            "backoff",
        );
        tokio::time::sleep(sleep).await;
        self.total_sleep += sleep;
        *self.sleep_by_reason.entry(reason).or_insert(Duration::ZERO) += sleep;
        Ok(())
    }

    /// Grand total slept so far.
    pub fn total_sleep(&self) -> Duration {
        self.total_sleep
    }

    /// Sleep accumulated per reason.
    pub fn sleep_by_reason(&self) -> &BTreeMap<BackoffReason, Duration> {
        &self.sleep_by_reason
    }

    /// Retry count per reason.
    pub fn times_by_reason(&self) -> &BTreeMap<BackoffReason, u32> {
        &self.times_by_reason
    }
}
