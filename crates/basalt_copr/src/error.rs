//! Error types surfaced by the batch coprocessor dispatcher.

use thiserror::Error;

use crate::backoff::BackoffReason;
use crate::region::RegionId;

/// Errors produced while building, dispatching, or draining a batch read.
///
/// Every error that reaches the response channel is delivered to the caller
/// through `next`; nothing is swallowed inside the workers.
#[derive(Debug, Error)]
pub enum CoprError {
    /// Batch reads stream fragments without per-region start keys, so the
    /// client cannot honor ordered or descending scans.
    #[error("batch coprocessor cannot keep order or scan in descending order")]
    OrderedScanUnsupported,

    /// The caller flipped the killed flag while the query was draining.
    #[error("query interrupted by caller")]
    QueryInterrupted,

    /// The analytical store stopped responding mid-stream.
    #[error("analytical store server timeout")]
    ServerTimeout,

    /// No analytical replica is currently known for the region.
    #[error("no analytical replica available for region {0}")]
    RegionMiss(RegionId),

    /// The per-request backoff budget ran out before the operation recovered.
    #[error("{reason} backoff budget exhausted")]
    BackoffExhausted {
        reason: BackoffReason,
        #[source]
        cause: Box<CoprError>,
    },

    /// The store reported a request-level failure inside the stream.
    #[error("store error from {addr}: {msg}")]
    Store { addr: String, msg: String },

    /// Collaborator failures (region cache, sender, visibility check).
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl CoprError {
    /// Whether this error came from the caller asking the query to stop.
    pub fn is_interrupt(&self) -> bool {
        matches!(self, CoprError::QueryInterrupted)
    }
}
