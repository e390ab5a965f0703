//! Response records handed to the caller, one per streamed fragment.

use std::collections::BTreeMap;
use std::mem;
use std::time::Duration;

use bytes::Bytes;

use crate::backoff::{BackoffReason, Backoffer};
use crate::error::CoprError;
use crate::rpc::BatchResponse;

/// Retry attribution for the worker that produced a record: where the time
/// went while the fragment was being fetched.
#[derive(Clone, Debug, Default)]
pub struct CopRuntimeStats {
    /// Grand total slept in backoff so far on this worker.
    pub backoff_time: Duration,
    pub backoff_sleep: BTreeMap<BackoffReason, Duration>,
    pub backoff_times: BTreeMap<BackoffReason, u32>,
    /// Address of the store that served the fragment.
    pub callee_address: String,
}

impl CopRuntimeStats {
    /// Snapshot the accumulator of the worker that is producing records.
    pub(crate) fn snapshot(bo: &Backoffer, callee: &str) -> Self {
        Self {
            backoff_time: bo.total_sleep(),
            backoff_sleep: bo.sleep_by_reason().clone(),
            backoff_times: bo.times_by_reason().clone(),
            callee_address: callee.to_string(),
        }
    }
}

/// One response fragment as seen by the caller.
///
/// Terminal records may carry only an error; the iterator surfaces that
/// error from `next` instead of returning the record.
#[derive(Debug, Default)]
pub struct BatchCopResponse {
    resp: Option<BatchResponse>,
    detail: CopRuntimeStats,
    // Batch responses carry no per-region start key; kept (always empty) for
    // interface parity with per-region reads.
    start_key: Bytes,
    pub(crate) err: Option<CoprError>,
    duration: Duration,
    resp_size: u64,
}

impl BatchCopResponse {
    pub(crate) fn from_wire(resp: BatchResponse, detail: CopRuntimeStats, duration: Duration) -> Self {
        Self {
            resp: Some(resp),
            detail,
            duration,
            ..Self::default()
        }
    }

    pub(crate) fn from_error(err: CoprError) -> Self {
        Self {
            err: Some(err),
            ..Self::default()
        }
    }

    /// Raw result bytes of this fragment.
    pub fn data(&self) -> &[u8] {
        self.resp.as_ref().map(|r| r.data.as_ref()).unwrap_or(&[])
    }

    /// Always empty in batch mode.
    pub fn start_key(&self) -> &[u8] {
        &self.start_key
    }

    pub fn runtime_stats(&self) -> &CopRuntimeStats {
        &self.detail
    }

    /// Wall-clock time from the RPC round start to this fragment.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Approximate memory held by this record, memoized so repeated
    /// accounting queries are O(1).
    pub fn mem_size(&mut self) -> u64 {
        if self.resp_size != 0 {
            return self.resp_size;
        }
        let mut size = self.start_key.len() as u64;
        size += mem::size_of::<CopRuntimeStats>() as u64;
        if let Some(resp) = &self.resp {
            size += resp.size() as u64;
        }
        self.resp_size = size;
        self.resp_size
    }
}
