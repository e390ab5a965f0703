//! The concurrent iterator and its per-batch workers.
//!
//! One tokio task per batch task streams fragments into a bounded channel;
//! the caller drains through `next`. There are no locks: coordination is the
//! channel, two cancellation tokens (finish + RPC cancel), and one CAS-
//! guarded `closed` bit, because caller `close` and a drain-observed context
//! cancellation race to fire the finish signal.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::backoff::{BackoffReason, Backoffer};
use crate::config::CoprConfig;
use crate::error::CoprError;
use crate::range::KeyRanges;
use crate::region::{RegionCache, ReplicaClass};
use crate::response::{BatchCopResponse, CopRuntimeStats};
use crate::rpc::{
    BatchCopStream, BatchRequest, BatchResponse, BatchSender, RegionEpoch, RequestHeader,
    SendOutcome, StoreRequest, StreamError, WireRegion,
};
use crate::tasks::{build_batch_cop_tasks, BatchTask};
use crate::{BatchReadRequest, IsolationLevel, MemoryTracker, Priority, QueryVars, SnapshotVisibility};

/// Bounded capacity of the worker→drain response channel.
const RESP_CHANNEL_CAPACITY: usize = 2048;
/// How often the drain polls the killed flag while waiting for records.
const KILL_CHECK_INTERVAL: Duration = Duration::from_secs(3);

/// Streaming result handle for one batch read.
///
/// Poll `next` until it returns `Ok(None)`; call `close` to stop early.
pub struct BatchCopIterator {
    state: IterState,
}

enum IterState {
    /// Construction failed before any worker started. The first `next`
    /// yields the error, later calls yield `Ok(None)`, `close` is a no-op.
    Failed(Option<CoprError>),
    Running(Running),
}

struct Running {
    resp_rx: mpsc::Receiver<BatchCopResponse>,
    finish: CancellationToken,
    caller: CancellationToken,
    rpc_cancel: CancellationToken,
    // Close can be triggered by the caller and by a context cancellation
    // observed in the drain; the CAS makes sure `finish` fires once.
    closed: AtomicBool,
    run_handle: Option<tokio::task::JoinHandle<()>>,
    vars: Arc<QueryVars>,
    visibility: Arc<dyn SnapshotVisibility>,
    tracker: Option<Arc<dyn MemoryTracker>>,
    start_ts: u64,
}

enum Drained {
    Record(BatchCopResponse),
    Killed,
    Exit,
}

impl BatchCopIterator {
    pub(crate) fn failed(err: CoprError) -> Self {
        Self {
            state: IterState::Failed(Some(err)),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        tasks: Vec<BatchTask>,
        cache: Arc<dyn RegionCache>,
        sender: Arc<dyn BatchSender>,
        config: CoprConfig,
        req: &BatchReadRequest,
        vars: Arc<QueryVars>,
        visibility: Arc<dyn SnapshotVisibility>,
        tracker: Option<Arc<dyn MemoryTracker>>,
        caller: CancellationToken,
    ) -> Self {
        let (resp_tx, resp_rx) = mpsc::channel(RESP_CHANNEL_CAPACITY);
        let finish = CancellationToken::new();
        let rpc_cancel = CancellationToken::new();
        let shared = Arc::new(WorkerShared {
            cache,
            sender,
            config,
            req: RequestEnvelope::from_request(req),
            finish: finish.clone(),
            rpc_cancel: rpc_cancel.clone(),
        });

        let mut workers = JoinSet::new();
        for task in tasks {
            let bo = Backoffer::new(config.max_next_backoff);
            workers.spawn(handle_task(shared.clone(), resp_tx.clone(), bo, task));
        }
        drop(resp_tx);
        // The channel closes once the last worker drops its sender; this
        // task only exists so `close` can wait for every worker to exit.
        let run_handle = tokio::spawn(async move {
            while workers.join_next().await.is_some() {}
        });

        Self {
            state: IterState::Running(Running {
                resp_rx,
                finish,
                caller,
                rpc_cancel,
                closed: AtomicBool::new(false),
                run_handle: Some(run_handle),
                vars,
                visibility,
                tracker,
                start_ts: req.start_ts,
            }),
        }
    }

    /// Next response record. `Ok(None)` means the stream has ended cleanly;
    /// keep polling until it is returned.
    pub async fn next(&mut self) -> Result<Option<BatchCopResponse>, CoprError> {
        match &mut self.state {
            IterState::Failed(err) => match err.take() {
                Some(err) => Err(err),
                None => Ok(None),
            },
            IterState::Running(run) => run.next().await,
        }
    }

    /// Stop the read: signal shutdown, cancel in-flight RPCs, and wait for
    /// every worker to exit. Safe to call any number of times, and before
    /// the stream is fully drained.
    pub async fn close(&mut self) -> Result<(), CoprError> {
        match &mut self.state {
            IterState::Failed(_) => Ok(()),
            IterState::Running(run) => {
                if run.try_close() {
                    run.finish.cancel();
                }
                run.rpc_cancel.cancel();
                if let Some(handle) = run.run_handle.take() {
                    let _ = handle.await;
                }
                Ok(())
            }
        }
    }
}

impl Running {
    /// CAS the closed bit; true when this call won the close race.
    fn try_close(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    async fn next(&mut self) -> Result<Option<BatchCopResponse>, CoprError> {
        let mut record = match self.recv_from_resp_ch().await {
            Drained::Record(record) => record,
            Drained::Killed => return Err(CoprError::QueryInterrupted),
            Drained::Exit => return Ok(None),
        };
        if let Some(err) = record.err.take() {
            return Err(err);
        }
        self.visibility.check_visibility(self.start_ts)?;
        if let Some(tracker) = &self.tracker {
            tracker.consume(record.mem_size());
        }
        Ok(Some(record))
    }

    async fn recv_from_resp_ch(&mut self) -> Drained {
        // Killing is rare, so the flag is polled on a ticker instead of
        // wiring per-worker cancellation into the drain.
        let mut kill_check = tokio::time::interval_at(
            tokio::time::Instant::now() + KILL_CHECK_INTERVAL,
            KILL_CHECK_INTERVAL,
        );
        loop {
            tokio::select! {
                record = self.resp_rx.recv() => {
                    return match record {
                        Some(record) => Drained::Record(record),
                        None => Drained::Exit,
                    };
                }
                _ = kill_check.tick() => {
                    if self.vars.is_killed() {
                        return Drained::Killed;
                    }
                }
                _ = self.finish.cancelled() => return Drained::Exit,
                _ = self.caller.cancelled() => {
                    // Caller cancellation is observed here in the drain, not
                    // in the workers.
                    if self.try_close() {
                        self.finish.cancel();
                    }
                    return Drained::Exit;
                }
            }
        }
    }
}

impl Drop for Running {
    fn drop(&mut self) {
        self.finish.cancel();
        self.rpc_cancel.cancel();
    }
}

/// Request fields every worker needs, cloned out of the caller's request.
struct RequestEnvelope {
    req_type: i64,
    start_ts: u64,
    data: Bytes,
    schema_ver: i64,
    replica_class: ReplicaClass,
    isolation_level: IsolationLevel,
    priority: Priority,
    not_fill_cache: bool,
    task_id: u64,
}

impl RequestEnvelope {
    fn from_request(req: &BatchReadRequest) -> Self {
        Self {
            req_type: req.req_type,
            start_ts: req.start_ts,
            data: req.data.clone(),
            schema_ver: req.schema_ver,
            replica_class: req.replica_class,
            isolation_level: req.isolation_level,
            priority: req.priority,
            not_fill_cache: req.not_fill_cache,
            task_id: req.task_id,
        }
    }
}

struct WorkerShared {
    cache: Arc<dyn RegionCache>,
    sender: Arc<dyn BatchSender>,
    config: CoprConfig,
    req: RequestEnvelope,
    finish: CancellationToken,
    rpc_cancel: CancellationToken,
}

/// One worker: drive its batch task (plus any rebuilds) to completion.
async fn handle_task(
    shared: Arc<WorkerShared>,
    resp_tx: mpsc::Sender<BatchCopResponse>,
    mut bo: Backoffer,
    task: BatchTask,
) {
    let mut pending = vec![task];
    let mut idx = 0;
    while idx < pending.len() {
        match handle_task_once(&shared, &resp_tx, &mut bo, &pending[idx]).await {
            Ok(follow_ups) => pending.extend(follow_ups),
            Err(err) => {
                send_to_resp_ch(&shared, &resp_tx, BatchCopResponse::from_error(err)).await;
                break;
            }
        }
        idx += 1;
    }
}

/// One RPC round trip. A store-level retry rebuilds the whole batch and
/// returns the replacement tasks; a stream is drained through the adapter.
async fn handle_task_once(
    shared: &WorkerShared,
    resp_tx: &mpsc::Sender<BatchCopResponse>,
    bo: &mut Backoffer,
    task: &BatchTask,
) -> Result<Vec<BatchTask>, CoprError> {
    let regions = task
        .regions
        .iter()
        .map(|info| WireRegion {
            region_id: info.region.id,
            epoch: RegionEpoch {
                conf_ver: info.region.conf_ver,
                version: info.region.ver,
            },
            ranges: info.ranges.as_slice().to_vec(),
        })
        .collect();
    let req = StoreRequest {
        cmd: task.cmd,
        store_class: shared.req.replica_class,
        body: BatchRequest {
            req_type: shared.req.req_type,
            start_ts: shared.req.start_ts,
            data: shared.req.data.clone(),
            schema_ver: shared.req.schema_ver,
            regions,
        },
        header: RequestHeader {
            isolation_level: shared.req.isolation_level,
            priority: shared.req.priority,
            not_fill_cache: shared.req.not_fill_cache,
            record_time_stat: true,
            record_scan_stat: true,
            task_id: shared.req.task_id,
        },
    };

    tracing::debug!(
        store = %task.store_addr,
        regions = task.regions.len(),
        "sending batch coprocessor request",
    );
    let round_start = Instant::now();
    let outcome = shared
        .sender
        .send(
            bo,
            &task.ctx,
            &task.regions,
            req,
            shared.config.read_timeout_ultra_long,
            &shared.rpc_cancel,
        )
        .await?;
    match outcome {
        // Store-level errors invalidate routing for every region in the
        // batch; rebuild from the unioned ranges.
        SendOutcome::Retry => rebuild_batch_tasks(shared, bo, task).await,
        SendOutcome::Stream(stream) => {
            handle_streamed_response(shared, resp_tx, bo, task, stream, round_start).await?;
            Ok(Vec::new())
        }
    }
}

/// Union the batch's ranges and run construction again. Region boundaries
/// may have changed since the original build, so the replacement tasks can
/// differ in shape.
async fn rebuild_batch_tasks(
    shared: &WorkerShared,
    bo: &mut Backoffer,
    task: &BatchTask,
) -> Result<Vec<BatchTask>, CoprError> {
    let mut ranges = Vec::new();
    for info in &task.regions {
        info.ranges.collect_into(&mut ranges);
    }
    tracing::debug!(
        store = %task.store_addr,
        ranges = ranges.len(),
        "rebuilding batch tasks after store error",
    );
    build_batch_cop_tasks(bo, shared.cache.as_ref(), &KeyRanges::new(ranges)).await
}

/// Drain one stream through the adapter until EOF, shutdown, or error.
/// Dropping `stream` on every return path releases the wire channel.
async fn handle_streamed_response(
    shared: &WorkerShared,
    resp_tx: &mpsc::Sender<BatchCopResponse>,
    bo: &mut Backoffer,
    task: &BatchTask,
    mut stream: BatchCopStream,
    round_start: Instant,
) -> Result<(), CoprError> {
    let Some(mut resp) = stream.first.take() else {
        // The server finished during the handshake; nothing to deliver.
        return Ok(());
    };
    loop {
        if handle_batch_response(shared, resp_tx, bo, task, resp, round_start).await? {
            return Ok(());
        }
        match stream.inner.recv().await {
            Ok(Some(next)) => resp = next,
            Ok(None) => return Ok(()),
            Err(err) => {
                let cancelled = matches!(err, StreamError::Cancelled);
                bo.backoff(
                    BackoffReason::StoreRpc,
                    CoprError::Other(anyhow::anyhow!(
                        "recv stream response error: {err}, store: {}",
                        task.store_addr
                    )),
                )
                .await?;
                if cancelled {
                    tracing::info!(store = %task.store_addr, "stream recv cancelled, treating as timeout");
                } else {
                    tracing::info!(store = %task.store_addr, error = %err, "stream recv failed");
                }
                return Err(CoprError::ServerTimeout);
            }
        }
    }
}

/// Adapt one wire fragment into a response record and enqueue it. Returns
/// true when the worker should stop because shutdown won the enqueue race.
async fn handle_batch_response(
    shared: &WorkerShared,
    resp_tx: &mpsc::Sender<BatchCopResponse>,
    bo: &Backoffer,
    task: &BatchTask,
    resp: BatchResponse,
    round_start: Instant,
) -> Result<bool, CoprError> {
    if !resp.other_error.is_empty() {
        tracing::warn!(
            start_ts = shared.req.start_ts,
            store = %task.store_addr,
            error = %resp.other_error,
            "batch stream carried store error",
        );
        return Err(CoprError::Store {
            addr: task.store_addr.clone(),
            msg: resp.other_error,
        });
    }

    let record = BatchCopResponse::from_wire(
        resp,
        CopRuntimeStats::snapshot(bo, &task.store_addr),
        round_start.elapsed(),
    );
    Ok(send_to_resp_ch(shared, resp_tx, record).await)
}

/// Enqueue a record, racing the finish signal. Returns true when the worker
/// should exit without producing further records.
async fn send_to_resp_ch(
    shared: &WorkerShared,
    resp_tx: &mpsc::Sender<BatchCopResponse>,
    record: BatchCopResponse,
) -> bool {
    tokio::select! {
        sent = resp_tx.send(record) => sent.is_err(),
        _ = shared.finish.cancelled() => true,
    }
}
