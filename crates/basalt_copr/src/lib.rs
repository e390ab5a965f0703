//! Client-side batch coprocessor dispatcher for Basalt's analytical tier.
//!
//! A batch read names a set of key ranges over the region-sharded store.
//! This crate splits those ranges against the region map, groups the pieces
//! into one batch per analytical store (rebalancing across replica-
//! equivalent stores so no node is swamped), and streams the per-store
//! responses back through a single iterator. The region cache and the
//! low-level RPC sender are supplied by the embedding engine through the
//! traits in [`region`] and [`rpc`].
//!
//! Batch responses carry no per-region start key, so there is no partial
//! retry and no ordering across batches: ordered (`keep_order`/descending)
//! reads are rejected up front, and recoverable store errors retry the
//! whole batch against a freshly built task set.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

pub mod backoff;
mod balance;
pub mod config;
pub mod error;
mod iterator;
pub mod range;
pub mod region;
pub mod response;
pub mod rpc;
pub mod tasks;

pub use config::CoprConfig;
pub use error::CoprError;
pub use iterator::BatchCopIterator;
pub use response::{BatchCopResponse, CopRuntimeStats};
pub use rpc::{IsolationLevel, Priority};

use backoff::Backoffer;
use range::{KeyRange, KeyRanges};
use region::{RegionCache, ReplicaClass};
use rpc::BatchSender;
use tasks::build_batch_cop_tasks;

/// Atomic per-query flags shared between the session and the dispatcher.
#[derive(Debug)]
pub struct QueryVars {
    killed: Arc<AtomicBool>,
}

impl QueryVars {
    pub fn new() -> Self {
        Self {
            killed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Ask the query to stop. The drain observes the flag on its next poll.
    pub fn kill(&self) {
        self.killed.store(true, Ordering::Release);
    }

    pub fn is_killed(&self) -> bool {
        self.killed.load(Ordering::Acquire)
    }
}

impl Default for QueryVars {
    fn default() -> Self {
        Self::new()
    }
}

/// Passive admission-control hook: receives the memoized size of every
/// record handed to the caller.
pub trait MemoryTracker: Send + Sync {
    fn consume(&self, bytes: u64);
}

/// Snapshot-visibility guard consulted before each record is handed out,
/// so a read cannot outlive the garbage-collection safe point unnoticed.
pub trait SnapshotVisibility: Send + Sync {
    fn check_visibility(&self, start_ts: u64) -> Result<(), CoprError>;
}

/// A batch read as submitted by the SQL executor.
#[derive(Clone, Debug)]
pub struct BatchReadRequest {
    /// Query type tag understood by the store's executor.
    pub req_type: i64,
    /// Snapshot timestamp all regions are read under.
    pub start_ts: u64,
    /// Opaque execution-plan payload forwarded to every store.
    pub data: Bytes,
    pub schema_ver: i64,
    /// User key ranges to cover; may be disjoint.
    pub ranges: Vec<KeyRange>,
    /// Ordered delivery request; unsupported in batch mode.
    pub keep_order: bool,
    /// Descending scan request; unsupported in batch mode.
    pub desc: bool,
    pub replica_class: ReplicaClass,
    pub isolation_level: IsolationLevel,
    pub priority: Priority,
    pub not_fill_cache: bool,
    pub task_id: u64,
}

impl Default for BatchReadRequest {
    fn default() -> Self {
        Self {
            req_type: 0,
            start_ts: 0,
            data: Bytes::new(),
            schema_ver: 0,
            ranges: Vec::new(),
            keep_order: false,
            desc: false,
            replica_class: ReplicaClass::Analytical,
            isolation_level: IsolationLevel::default(),
            priority: Priority::default(),
            not_fill_cache: false,
            task_id: 0,
        }
    }
}

/// Batch coprocessor client: builds per-store tasks for a read and runs the
/// fan-out, returning an iterator over response fragments.
pub struct BatchCopClient {
    cache: Arc<dyn RegionCache>,
    sender: Arc<dyn BatchSender>,
    visibility: Arc<dyn SnapshotVisibility>,
    config: CoprConfig,
}

impl BatchCopClient {
    pub fn new(
        cache: Arc<dyn RegionCache>,
        sender: Arc<dyn BatchSender>,
        visibility: Arc<dyn SnapshotVisibility>,
        config: CoprConfig,
    ) -> Self {
        Self {
            cache,
            sender,
            visibility,
            config,
        }
    }

    /// Dispatch one batch read. Construction failures (including ordered
    /// requests) come back as an iterator whose first `next` yields the
    /// error and whose `close` is a no-op; no workers are started for them.
    ///
    /// `caller` is the request context: cancelling it while draining ends
    /// the stream cleanly.
    pub async fn dispatch(
        &self,
        caller: CancellationToken,
        req: BatchReadRequest,
        vars: Arc<QueryVars>,
        tracker: Option<Arc<dyn MemoryTracker>>,
    ) -> BatchCopIterator {
        if req.keep_order || req.desc {
            return BatchCopIterator::failed(CoprError::OrderedScanUnsupported);
        }

        let mut bo = Backoffer::new(self.config.max_build_backoff);
        let ranges = KeyRanges::new(req.ranges.clone());
        let tasks = match build_batch_cop_tasks(&mut bo, self.cache.as_ref(), &ranges).await {
            Ok(tasks) => tasks,
            Err(err) => return BatchCopIterator::failed(err),
        };

        BatchCopIterator::spawn(
            tasks,
            self.cache.clone(),
            self.sender.clone(),
            self.config,
            &req,
            vars,
            self.visibility.clone(),
            tracker,
            caller,
        )
    }
}
