//! Batch task construction: split user ranges at region boundaries and
//! group the per-region pieces by the analytical replica that will serve
//! them.

use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::time::{Duration, Instant};

use crate::backoff::{BackoffReason, Backoffer};
use crate::balance::balance_batch_cop_tasks;
use crate::error::CoprError;
use crate::range::KeyRanges;
use crate::region::{RegionCache, RegionInfo, RpcContext};
use crate::rpc::CmdType;

/// Builds slower than this are logged; the build is still returned.
const BUILD_SLOW_LOG_THRESHOLD: Duration = Duration::from_millis(500);

/// The unit of work one worker sends to one store: every region in
/// `regions` lists the task's store among its replicas, and the first
/// region is one whose home store is this task's store.
#[derive(Clone, Debug)]
pub struct BatchTask {
    pub store_addr: String,
    pub cmd: CmdType,
    pub ctx: RpcContext,
    pub regions: Vec<RegionInfo>,
}

/// Split `ranges` against the region map and group the result into one task
/// per analytical store, rebalanced across replica-equivalent stores.
///
/// A region missing from the cache marks the snapshot stale: the build backs
/// off once per round and re-splits the full input until the cache has
/// caught up or the backoff budget runs out.
pub async fn build_batch_cop_tasks(
    bo: &mut Backoffer,
    cache: &dyn RegionCache,
    ranges: &KeyRanges,
) -> Result<Vec<BatchTask>, CoprError> {
    let start = Instant::now();
    let ranges_len = ranges.len();
    loop {
        let located = cache.split_key_ranges(bo, ranges).await?;

        let mut store_tasks: BTreeMap<String, BatchTask> = BTreeMap::new();
        let mut missing_region = None;
        for loc in located {
            let Some(rpc_ctx) = cache.analytical_rpc_context(bo, loc.region, false).await? else {
                // Stale snapshot for this region; re-split once the cache
                // has reloaded it.
                tracing::info!(
                    region = %loc.region,
                    "retrying batch task build, analytical peer missing from region cache",
                );
                missing_region = Some(loc.region);
                continue;
            };
            let all_stores = cache.all_analytical_stores(loc.region, &rpc_ctx.store);
            let info = RegionInfo {
                region: loc.region,
                meta: loc.meta,
                ranges: loc.ranges,
                all_stores,
            };
            match store_tasks.entry(rpc_ctx.store.addr.clone()) {
                Entry::Occupied(mut entry) => entry.get_mut().regions.push(info),
                Entry::Vacant(entry) => {
                    let addr = rpc_ctx.store.addr.clone();
                    entry.insert(BatchTask {
                        store_addr: addr,
                        cmd: CmdType::BatchCop,
                        ctx: rpc_ctx,
                        regions: vec![info],
                    });
                }
            }
        }

        if let Some(region) = missing_region {
            bo.backoff(BackoffReason::RegionMiss, CoprError::RegionMiss(region.id))
                .await?;
            continue;
        }

        let batch_tasks: Vec<BatchTask> = store_tasks.into_values().collect();
        tracing::debug!(shape = %task_shape(&batch_tasks), "before task balance");
        let batch_tasks = balance_batch_cop_tasks(batch_tasks);
        tracing::debug!(shape = %task_shape(&batch_tasks), "after task balance");

        let elapsed = start.elapsed();
        if elapsed > BUILD_SLOW_LOG_THRESHOLD {
            tracing::warn!(
                elapsed_ms = elapsed.as_millis() as u64,
                ranges = ranges_len,
                tasks = batch_tasks.len(),
                "building batch coprocessor tasks took too long",
            );
        }
        return Ok(batch_tasks);
    }
}

fn task_shape(tasks: &[BatchTask]) -> String {
    let mut shape = String::new();
    for task in tasks {
        let _ = write!(shape, "{}:{} ", task.store_addr, task.regions.len());
    }
    shape.truncate(shape.trim_end().len());
    shape
}
