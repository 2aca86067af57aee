//! Background reconciliation of replica counts.
//!
//! Every cycle snapshots the metadata, finds committed chunks with fewer
//! than R live replicas on active workers, and instructs a holder to copy
//! the chunk to a fresh destination. Copies are throttled by a semaphore;
//! the new placement stays pending until the destination's next heartbeat
//! confirms it.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{format_err, Error};
use tokio::sync::{watch, Semaphore};
use uuid::Uuid;

use sfs_api_types::{NodeRecord, ReplicaPlacement, ReplicaState, ReplicateRequest, ReplicateResponse};
use sfs_tools::http::HttpClient;

use super::{placement, Coordinator};

#[derive(Clone, Debug)]
struct RepairTask {
    chunk_id: Uuid,
    path: String,
    size: u64,
    /// `R - live`; chunks down to their last replica go first.
    priority: usize,
    /// Live committed placements usable as copy sources, verified first.
    sources: Vec<ReplicaPlacement>,
    /// Workers already holding any live placement; never a destination.
    holders: HashSet<String>,
    holder_racks: HashSet<String>,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct RepairStats {
    pub under_replicated: usize,
    pub scheduled: usize,
    pub unrecoverable: usize,
}

pub async fn run_repair_loop(coordinator: Arc<Coordinator>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(coordinator.config.repair_period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match repair_cycle(&coordinator).await {
                    Ok(stats) if stats.under_replicated > 0 => log::info!(
                        "repair cycle: {} under-replicated, {} copies scheduled, {} without a source",
                        stats.under_replicated,
                        stats.scheduled,
                        stats.unrecoverable,
                    ),
                    Ok(_) => (),
                    Err(err) => log::error!("repair cycle failed - {err:#}"),
                }
                if coordinator.config.rebalance {
                    if let Err(err) = rebalance_cycle(&coordinator).await {
                        log::error!("rebalance cycle failed - {err:#}");
                    }
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

pub async fn repair_cycle(coordinator: &Arc<Coordinator>) -> Result<RepairStats, Error> {
    let state = coordinator.snapshot_state().await;
    let replication = coordinator.config.replication;

    let active_ids: HashSet<String> = state
        .active_nodes_sorted()
        .iter()
        .map(|n| n.node_id.clone())
        .collect();

    let mut stats = RepairStats::default();
    let mut tasks = Vec::new();

    for file in state.files.values() {
        if file.is_deleted || state.is_provisional(&file.file_id) {
            continue;
        }
        for chunk in &file.chunks {
            if chunk.checksum.is_none() {
                continue;
            }
            let live: Vec<&ReplicaPlacement> = chunk
                .replicas
                .iter()
                .filter(|p| p.is_live() && active_ids.contains(&p.node_id))
                .collect();
            if live.len() >= replication {
                continue;
            }
            stats.under_replicated += 1;

            let mut sources: Vec<ReplicaPlacement> = live
                .iter()
                .filter(|p| p.state == ReplicaState::Committed)
                .map(|p| (*p).clone())
                .collect();
            sources.sort_by_key(|p| std::cmp::Reverse(p.verified));

            if sources.is_empty() {
                stats.unrecoverable += 1;
                log::warn!(
                    "chunk {} of {} has no committed live replica to copy from",
                    chunk.chunk_id,
                    file.path
                );
                continue;
            }

            tasks.push(RepairTask {
                chunk_id: chunk.chunk_id,
                path: file.path.clone(),
                size: chunk.size,
                priority: replication - live.len(),
                sources,
                holders: chunk
                    .replicas
                    .iter()
                    .filter(|p| p.is_live())
                    .map(|p| p.node_id.clone())
                    .collect(),
                holder_racks: chunk
                    .replicas
                    .iter()
                    .filter(|p| p.is_live())
                    .filter_map(|p| state.nodes.get(&p.node_id))
                    .filter_map(|n| n.rack.clone())
                    .collect(),
            });
        }
    }

    tasks.sort_by_key(|t| std::cmp::Reverse(t.priority));

    let semaphore = Arc::new(Semaphore::new(coordinator.config.max_repairs.max(1)));
    let mut handles = Vec::new();

    for task in tasks {
        let permit = match semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let coordinator = Arc::clone(coordinator);
        handles.push(tokio::spawn(async move {
            let _permit = permit;
            match execute_repair(&coordinator, &task).await {
                Ok(true) => 1usize,
                Ok(false) => 0,
                Err(err) => {
                    log::warn!(
                        "repair of chunk {} ({}) failed - {err:#}",
                        task.chunk_id,
                        task.path
                    );
                    0
                }
            }
        }));
    }

    for handle in handles {
        stats.scheduled += handle.await.unwrap_or(0);
    }
    Ok(stats)
}

/// Copies one chunk to a freshly chosen destination. Returns false when no
/// eligible destination exists (retried next round).
async fn execute_repair(coordinator: &Arc<Coordinator>, task: &RepairTask) -> Result<bool, Error> {
    // destinations come from a fresh snapshot; the cluster may have moved
    let state = coordinator.snapshot_state().await;
    let workers: Vec<NodeRecord> = state.active_nodes_sorted().into_iter().cloned().collect();

    let dest = match placement::pick_destination(
        &workers,
        &task.holders,
        &task.holder_racks,
        task.size,
    ) {
        Some(dest) => dest.clone(),
        None => return Ok(false),
    };
    drop(state);

    let mut last_err = format_err!("no copy source");
    for source in &task.sources {
        match replicate(&coordinator.http, source, task.chunk_id, &dest.url()).await {
            Ok(()) => {
                coordinator
                    .add_pending_placement(task.chunk_id, dest.node_id.clone(), dest.url())
                    .await?;
                log::info!(
                    "repair: chunk {} copied {} -> {}",
                    task.chunk_id,
                    source.node_id,
                    dest.node_id
                );
                return Ok(true);
            }
            Err(err) => {
                log::warn!(
                    "repair: source {} failed for chunk {} - {err:#}",
                    source.node_id,
                    task.chunk_id
                );
                last_err = err;
            }
        }
    }
    Err(last_err)
}

async fn replicate(
    http: &HttpClient,
    source: &ReplicaPlacement,
    chunk_id: Uuid,
    target_url: &str,
) -> Result<(), Error> {
    let uri = format!("{}/chunks/{}/replicate", source.url, chunk_id);
    let _: ReplicateResponse = http
        .post_json(
            &uri,
            &ReplicateRequest {
                target_url: target_url.to_string(),
            },
        )
        .await?;
    Ok(())
}

/// Moves placements from workers above average utilization to workers
/// below it, preserving R throughout: copy first, shed the surplus from
/// the busiest holder only once the copy is committed.
const MAX_MOVES_PER_CYCLE: usize = 8;
const REBALANCE_MARGIN: f64 = 0.10;

pub async fn rebalance_cycle(coordinator: &Arc<Coordinator>) -> Result<(), Error> {
    let state = coordinator.snapshot_state().await;
    let replication = coordinator.config.replication;

    let workers: Vec<NodeRecord> = state.active_nodes_sorted().into_iter().cloned().collect();
    if workers.len() <= replication {
        return Ok(());
    }

    let utilization = |node: &NodeRecord| 1.0 - node.free_ratio();
    let avg: f64 = workers.iter().map(|n| utilization(n)).sum::<f64>() / workers.len() as f64;
    let active_ids: HashSet<&str> = workers.iter().map(|n| n.node_id.as_str()).collect();

    let mut moves = 0;

    for file in state.files.values() {
        if moves >= MAX_MOVES_PER_CYCLE {
            break;
        }
        if file.is_deleted || state.is_provisional(&file.file_id) {
            continue;
        }
        for chunk in &file.chunks {
            if moves >= MAX_MOVES_PER_CYCLE {
                break;
            }
            if chunk.checksum.is_none() {
                continue;
            }

            let committed: Vec<&ReplicaPlacement> = chunk
                .replicas
                .iter()
                .filter(|p| {
                    p.state == ReplicaState::Committed && active_ids.contains(p.node_id.as_str())
                })
                .collect();

            if committed.len() > replication {
                // a previous move finished copying; shed from the busiest holder
                let busiest = committed
                    .iter()
                    .filter_map(|p| state.nodes.get(&p.node_id))
                    .max_by(|a, b| utilization(a).total_cmp(&utilization(b)));
                if let Some(node) = busiest {
                    log::info!(
                        "rebalance: shedding chunk {} from {}",
                        chunk.chunk_id,
                        node.node_id
                    );
                    coordinator
                        .shed_replica(chunk.chunk_id, &node.node_id)
                        .await?;
                    moves += 1;
                }
                continue;
            }

            if committed.len() != replication || chunk.replicas.len() > committed.len() {
                // under-replicated (repair's job) or a move already in flight
                continue;
            }

            let overloaded = committed
                .iter()
                .filter_map(|p| state.nodes.get(&p.node_id))
                .find(|n| utilization(n) > avg + REBALANCE_MARGIN);
            let source_node = match overloaded {
                Some(node) => node,
                None => continue,
            };
            let source = match chunk.replica(&source_node.node_id) {
                Some(placement) => placement.clone(),
                None => continue,
            };

            let holders: HashSet<String> =
                committed.iter().map(|p| p.node_id.clone()).collect();
            let underloaded: Vec<NodeRecord> = workers
                .iter()
                .filter(|n| utilization(n) < avg && !holders.contains(&n.node_id))
                .cloned()
                .collect();
            let dest = match placement::pick_destination(
                &underloaded,
                &holders,
                &HashSet::new(),
                chunk.size,
            ) {
                Some(dest) => dest.clone(),
                None => continue,
            };

            log::info!(
                "rebalance: moving chunk {} from {} to {}",
                chunk.chunk_id,
                source.node_id,
                dest.node_id
            );
            if let Err(err) =
                replicate(&coordinator.http, &source, chunk.chunk_id, &dest.url()).await
            {
                log::warn!("rebalance copy of chunk {} failed - {err:#}", chunk.chunk_id);
                continue;
            }
            coordinator
                .add_pending_placement(chunk.chunk_id, dest.node_id.clone(), dest.url())
                .await?;
            moves += 1;
        }
    }

    Ok(())
}
