//! Garbage collection of soft-deleted files.
//!
//! Files past the grace period get a best-effort physical delete on every
//! worker holding one of their chunks, then their records are purged in a
//! single journaled event. Per-worker failures are tolerated; leftover
//! bytes on a worker are reported as unknown chunk ids and ignored.

use std::sync::Arc;

use anyhow::Error;
use futures::StreamExt;
use tokio::sync::watch;
use uuid::Uuid;

use crate::time::epoch_i64;

use super::Coordinator;

const DELETE_CONCURRENCY: usize = 8;

#[derive(Clone, Copy, Debug, Default)]
pub struct GcStats {
    pub purged_files: usize,
    pub deleted_chunks: usize,
    pub failed_deletes: usize,
}

pub async fn run_gc_loop(coordinator: Arc<Coordinator>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(coordinator.config.gc_period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match gc_cycle(&coordinator).await {
                    Ok(stats) if stats.purged_files > 0 => log::info!(
                        "gc: purged {} files, removed {} chunk replicas ({} delete failures)",
                        stats.purged_files,
                        stats.deleted_chunks,
                        stats.failed_deletes,
                    ),
                    Ok(_) => (),
                    Err(err) => log::error!("gc cycle failed - {err:#}"),
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

pub async fn gc_cycle(coordinator: &Arc<Coordinator>) -> Result<GcStats, Error> {
    let now = epoch_i64();
    let cutoff = now - coordinator.config.gc_grace;
    let state = coordinator.snapshot_state().await;

    let mut purged: Vec<Uuid> = Vec::new();
    let mut deletes: Vec<(String, Uuid)> = Vec::new();

    for file in state.files.values() {
        if !file.is_deleted {
            continue;
        }
        if file.deleted_at.unwrap_or(0) > cutoff {
            continue;
        }
        purged.push(file.file_id);
        for chunk in &file.chunks {
            for placement in &chunk.replicas {
                if !placement.url.is_empty() {
                    deletes.push((placement.url.clone(), chunk.chunk_id));
                }
            }
        }
    }

    if purged.is_empty() {
        return Ok(GcStats::default());
    }

    let mut stats = GcStats {
        purged_files: purged.len(),
        ..Default::default()
    };

    let results: Vec<bool> = futures::stream::iter(deletes)
        .map(|(url, chunk_id)| {
            let http = coordinator.http.clone();
            async move {
                let uri = format!("{url}/chunks/{chunk_id}");
                match http.delete(&uri).await {
                    Ok(()) => true,
                    Err(err) => {
                        log::warn!("gc: delete {uri} failed - {err:#}");
                        false
                    }
                }
            }
        })
        .buffer_unordered(DELETE_CONCURRENCY)
        .collect()
        .await;
    stats.deleted_chunks = results.iter().filter(|ok| **ok).count();
    stats.failed_deletes = results.len() - stats.deleted_chunks;

    let mut locked = coordinator.state.write().await;
    coordinator.commit_event(
        &mut locked,
        crate::metastore::MetaEvent::FilesPurged { file_ids: purged },
    )?;

    Ok(stats)
}
