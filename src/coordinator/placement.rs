//! Placement policy: capacity-weighted round-robin.
//!
//! For chunk `i` over the active workers sorted by id, the candidate order
//! starts at `i mod |W|` and wraps, skipping workers that are low on space.
//! Ties between equally eligible candidates prefer more free bytes. The
//! policy is deterministic given the same active-worker snapshot.

use std::collections::HashSet;

use sfs_api_types::{NodeRecord, MIN_FREE_RATIO};

fn eligible(node: &NodeRecord, chunk_size: u64) -> bool {
    node.free_ratio() >= MIN_FREE_RATIO && node.free_space >= chunk_size
}

/// Selects `replication` distinct workers for chunk `chunk_index`.
/// `workers` must be the active set sorted by node id. Returns `None` when
/// fewer than `replication` workers qualify.
///
/// When rack labels are present on the eligible workers, the chosen set is
/// adjusted so that at least two racks are represented; with no labels the
/// constraint is vacuous.
pub fn select_targets<'a>(
    workers: &'a [NodeRecord],
    chunk_index: usize,
    chunk_size: u64,
    replication: usize,
) -> Option<Vec<&'a NodeRecord>> {
    if workers.len() < replication || replication == 0 {
        return None;
    }

    // round-robin order for this chunk, then stable-sorted so that equally
    // placed candidates with more free space win the tie
    let mut candidates: Vec<&NodeRecord> = (0..workers.len())
        .map(|k| &workers[(chunk_index + k) % workers.len()])
        .filter(|n| eligible(n, chunk_size))
        .collect();

    if candidates.len() < replication {
        return None;
    }

    let mut chosen: Vec<&NodeRecord> = candidates[..replication].to_vec();

    // rack spread: if every pick shares one rack but another rack exists,
    // swap the last pick for the best candidate on a different rack
    let racks: HashSet<&str> = chosen.iter().filter_map(|n| n.rack.as_deref()).collect();
    if racks.len() == 1 && chosen.iter().all(|n| n.rack.is_some()) {
        let rack = *racks.iter().next().unwrap();
        let other = candidates
            .drain(replication..)
            .find(|n| n.rack.as_deref().map(|r| r != rack).unwrap_or(true));
        if let Some(other) = other {
            chosen.pop();
            chosen.push(other);
        }
    }

    // tie-break within the chosen set: more free bytes first
    chosen.sort_by(|a, b| {
        b.free_space
            .cmp(&a.free_space)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });

    Some(chosen)
}

/// Picks a repair destination: active, not already holding the chunk,
/// enough free bytes. Prefers a rack that does not appear among the
/// current holders, then more free space.
pub fn pick_destination<'a>(
    workers: &'a [NodeRecord],
    holders: &HashSet<String>,
    holder_racks: &HashSet<String>,
    chunk_size: u64,
) -> Option<&'a NodeRecord> {
    let mut candidates: Vec<&NodeRecord> = workers
        .iter()
        .filter(|n| !holders.contains(&n.node_id) && eligible(n, chunk_size))
        .collect();

    candidates.sort_by(|a, b| {
        let a_new_rack = a.rack.as_ref().map(|r| !holder_racks.contains(r)).unwrap_or(false);
        let b_new_rack = b.rack.as_ref().map(|r| !holder_racks.contains(r)).unwrap_or(false);
        b_new_rack
            .cmp(&a_new_rack)
            .then_with(|| b.free_space.cmp(&a.free_space))
            .then_with(|| a.node_id.cmp(&b.node_id))
    });

    candidates.first().copied()
}
