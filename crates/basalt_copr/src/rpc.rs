//! Wire request/response shapes and the sender seam.
//!
//! Serialization of the request body is the sender's business; this crate
//! only assembles the structs. The sender is expected to honor the cancel
//! token by failing the in-flight call (or the stream's `recv`) promptly
//! once it fires.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::backoff::Backoffer;
use crate::error::CoprError;
use crate::range::KeyRange;
use crate::region::{RegionInfo, ReplicaClass, RpcContext};

/// Command space of the coprocessor protocol. This client only issues
/// `BatchCop`; `Cop` is the unary per-region variant served elsewhere.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CmdType {
    Cop,
    BatchCop,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum IsolationLevel {
    #[default]
    Si,
    Rc,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
}

/// Region epoch as carried on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RegionEpoch {
    pub conf_ver: u64,
    pub version: u64,
}

/// One region entry of the batch request body.
#[derive(Clone, Debug)]
pub struct WireRegion {
    pub region_id: u64,
    pub epoch: RegionEpoch,
    pub ranges: Vec<KeyRange>,
}

/// Batch coprocessor request body.
#[derive(Clone, Debug)]
pub struct BatchRequest {
    /// Query type tag understood by the store's executor.
    pub req_type: i64,
    /// Snapshot timestamp all regions are read under.
    pub start_ts: u64,
    /// Opaque execution-plan payload.
    pub data: Bytes,
    pub schema_ver: i64,
    pub regions: Vec<WireRegion>,
}

/// Per-call context carried in the enclosing RPC header.
#[derive(Clone, Debug, Default)]
pub struct RequestHeader {
    pub isolation_level: IsolationLevel,
    pub priority: Priority,
    pub not_fill_cache: bool,
    pub record_time_stat: bool,
    pub record_scan_stat: bool,
    pub task_id: u64,
}

/// Fully assembled store request: command tag, replica class, body, header.
#[derive(Clone, Debug)]
pub struct StoreRequest {
    pub cmd: CmdType,
    /// Which replica engine on the receiving node serves this request.
    pub store_class: ReplicaClass,
    pub body: BatchRequest,
    pub header: RequestHeader,
}

/// One streamed response fragment. Either `data` is populated or
/// `other_error` names a request-level failure.
#[derive(Clone, Debug, Default)]
pub struct BatchResponse {
    pub data: Bytes,
    pub other_error: String,
}

impl BatchResponse {
    /// Approximate wire size, used for memory accounting.
    pub fn size(&self) -> usize {
        self.data.len() + self.other_error.len()
    }
}

/// Why a stream `recv` failed.
#[derive(Debug)]
pub enum StreamError {
    /// The in-flight call was cancelled (caller shutdown or RPC deadline).
    Cancelled,
    Other(anyhow::Error),
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::Cancelled => f.write_str("stream cancelled"),
            StreamError::Other(err) => write!(f, "{err}"),
        }
    }
}

/// Receiving half of one streaming round trip.
///
/// `Ok(None)` is the normal end of stream. Dropping the handle releases the
/// underlying wire channel, so every exit path of the consumer closes it.
#[async_trait]
pub trait BatchResponseStream: Send {
    async fn recv(&mut self) -> Result<Option<BatchResponse>, StreamError>;
}

/// A live stream plus the response the transport bundled with the handshake
/// (absent when the server finished before sending anything).
pub struct BatchCopStream {
    pub first: Option<BatchResponse>,
    pub inner: Box<dyn BatchResponseStream>,
}

/// Outcome of one send attempt.
pub enum SendOutcome {
    /// Store-level failure. The whole batch must be rebuilt and retried;
    /// batch responses carry no per-region start key, so partial retry is
    /// impossible.
    Retry,
    Stream(BatchCopStream),
}

/// Lower-level RPC sender seam.
#[async_trait]
pub trait BatchSender: Send + Sync {
    async fn send(
        &self,
        bo: &mut Backoffer,
        ctx: &RpcContext,
        regions: &[RegionInfo],
        req: StoreRequest,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SendOutcome, CoprError>;
}
