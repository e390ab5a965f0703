//! Redistribution of regions across replica-equivalent stores.
//!
//! After construction every region sits on its home store, so a skewed
//! region→home distribution overloads one node. The balancer moves regions
//! with more than one valid replica target, under three rules:
//! 1. the first region of each original task stays on its original store,
//!    so no store present before balancing is ever emptied;
//! 2. a region only moves to a store that is in its own replica list and
//!    already serves at least one home region;
//! 3. a region with a single valid target is pinned there outright.
//!
//! Store weight is `candidates/avg + placed`, where `avg` is the mean number
//! of replica slots per movable region: stores that could absorb many
//! regions later are discounted now, stores already heavy are penalized.
//! After each placement only the stores touched by the placed region are
//! rescanned against the chosen store's weight; a full rescan would be
//! marginally better but the local one is good enough in practice.

use std::collections::BTreeMap;

use crate::region::{RegionInfo, RegionVerId, StoreId};
use crate::tasks::BatchTask;

fn weight(candidates: usize, placed: usize, avg: f64) -> f64 {
    candidates as f64 / avg + placed as f64
}

fn find_next_store(
    store_tasks: &BTreeMap<StoreId, BatchTask>,
    candidates: &BTreeMap<StoreId, BTreeMap<RegionVerId, RegionInfo>>,
    avg: f64,
) -> Option<StoreId> {
    let mut best: Option<(StoreId, f64)> = None;
    for (store_id, task) in store_tasks {
        let candidate_len = candidates.get(store_id).map(BTreeMap::len).unwrap_or(0);
        match &mut best {
            None => {
                if candidate_len > 0 {
                    best = Some((*store_id, weight(candidate_len, task.regions.len(), avg)));
                }
            }
            Some((best_id, best_weight)) => {
                if candidate_len == 0 {
                    continue;
                }
                let w = weight(candidate_len, task.regions.len(), avg);
                if w < *best_weight {
                    *best_id = *store_id;
                    *best_weight = w;
                }
            }
        }
    }
    best.map(|(store_id, _)| store_id)
}

/// Rebalance `original` tasks; returns the input unmodified when there is
/// nothing to move or when a region shows up as a candidate twice (a
/// duplicate would double-count work, so balancing is abandoned).
pub(crate) fn balance_batch_cop_tasks(original: Vec<BatchTask>) -> Vec<BatchTask> {
    if original.is_empty() {
        return original;
    }

    let mut store_tasks: BTreeMap<StoreId, BatchTask> = BTreeMap::new();
    let mut candidates: BTreeMap<StoreId, BTreeMap<RegionVerId, RegionInfo>> = BTreeMap::new();
    let mut total_candidate_slots = 0usize;
    let mut total_remaining = 0usize;

    // Anchor pass: each store keeps its first region.
    for task in &original {
        let home = task.regions[0].home_store();
        store_tasks.insert(
            home,
            BatchTask {
                store_addr: task.store_addr.clone(),
                cmd: task.cmd,
                ctx: task.ctx.clone(),
                regions: vec![task.regions[0].clone()],
            },
        );
        candidates.insert(home, BTreeMap::new());
    }

    // Candidate pass: pin regions with one valid target, spread the rest
    // over every tracked store in their replica list.
    let mut duplicated = false;
    'candidates: for task in &original {
        let home = task.regions[0].home_store();
        for (idx, info) in task.regions.iter().enumerate() {
            if idx == 0 {
                continue;
            }
            let valid_stores = if info.all_stores.len() <= 1 {
                1
            } else {
                info.all_stores
                    .iter()
                    .filter(|store_id| candidates.contains_key(store_id))
                    .count()
            };
            if valid_stores == 1 {
                if let Some(task) = store_tasks.get_mut(&home) {
                    task.regions.push(info.clone());
                }
            } else {
                total_candidate_slots += valid_stores;
                total_remaining += 1;
                let key = info.region;
                for store_id in &info.all_stores {
                    if let Some(candidate_map) = candidates.get_mut(store_id) {
                        if candidate_map.insert(key, info.clone()).is_some() {
                            // Duplicated region: give up balancing.
                            duplicated = true;
                            break 'candidates;
                        }
                    }
                }
            }
        }
    }
    if duplicated || total_remaining == 0 {
        return original;
    }

    let mut avg = total_candidate_slots as f64 / total_remaining as f64;
    let mut current = find_next_store(&store_tasks, &candidates, avg);
    while total_remaining > 0 {
        let Some(store) = current else { break };
        if candidates.get(&store).map_or(true, BTreeMap::is_empty) {
            current = find_next_store(&store_tasks, &candidates, avg);
            continue;
        }

        let Some((key, info)) = candidates
            .get(&store)
            .and_then(|candidate_map| candidate_map.iter().next())
            .map(|(key, info)| (*key, info.clone()))
        else {
            break;
        };
        if let Some(task) = store_tasks.get_mut(&store) {
            task.regions.push(info.clone());
        }
        total_remaining -= 1;
        for store_id in &info.all_stores {
            if let Some(candidate_map) = candidates.get_mut(store_id) {
                if candidate_map.remove(&key).is_some() {
                    total_candidate_slots -= 1;
                }
            }
        }

        if total_remaining > 0 {
            // Reference weight of the chosen store uses the pre-placement
            // average; touched stores are compared against the recomputed one.
            let placed = store_tasks.get(&store).map(|t| t.regions.len()).unwrap_or(0);
            let candidate_len = candidates.get(&store).map(BTreeMap::len).unwrap_or(0);
            let mut best_weight = weight(candidate_len, placed, avg);
            avg = total_candidate_slots as f64 / total_remaining as f64;
            let mut next = store;
            for store_id in &info.all_stores {
                if *store_id == store {
                    continue;
                }
                let candidate_len = candidates.get(store_id).map(BTreeMap::len).unwrap_or(0);
                if candidate_len == 0 {
                    continue;
                }
                let placed = store_tasks.get(store_id).map(|t| t.regions.len()).unwrap_or(0);
                let w = weight(candidate_len, placed, avg);
                if w <= best_weight {
                    next = *store_id;
                    best_weight = w;
                }
            }
            current = Some(next);
        }
    }

    store_tasks.into_values().collect()
}
