//! Heartbeat emitter and periodic inventory maintenance.

use std::sync::Arc;

use anyhow::Error;
use tokio::sync::watch;

use sfs_api_types::{HeartbeatRequest, HeartbeatResponse};

use super::Worker;

/// POSTs the full inventory and disk usage to the coordinator every
/// heartbeat interval. A missed heartbeat is logged and retried next tick;
/// the worker never crashes over it.
pub async fn run_heartbeat_loop(worker: Arc<Worker>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(worker.config.heartbeat_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(err) = send_heartbeat(&worker).await {
                    log::warn!("heartbeat failed - {err:#}");
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

pub async fn send_heartbeat(worker: &Worker) -> Result<(), Error> {
    let (free_space, total_space) = worker.store().usage()?;
    let request = HeartbeatRequest {
        node_id: worker.node_id().to_string(),
        host: worker.config.host.clone(),
        port: worker.config.port,
        rack: worker.config.rack.clone(),
        free_space,
        total_space,
        chunk_ids: worker.store().inventory(),
    };

    let uri = format!(
        "{}/api/v1/nodes/heartbeat",
        worker.config.coordinator_url.trim_end_matches('/')
    );
    let _: HeartbeatResponse = worker.http.post_json(&uri, &request).await?;
    Ok(())
}

/// Hourly full rescan plus scrub: catches out-of-band modifications and
/// quarantines bit-rot so the next heartbeat stops reporting it.
pub async fn run_maintenance_loop(worker: Arc<Worker>, mut shutdown: watch::Receiver<bool>) {
    let mut interval = tokio::time::interval(worker.config.rescan_period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the startup scan already ran in ChunkStore::open
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let store = Arc::clone(worker.store());
                let result = tokio::task::spawn_blocking(move || {
                    let found = store.rescan()?;
                    let stats = store.scrub();
                    Ok::<_, sfs_chunkstore::ChunkStoreError>((found, stats))
                })
                .await;

                match result {
                    Ok(Ok((found, stats))) => {
                        if stats.quarantined > 0 {
                            log::warn!(
                                "scrub: {} of {} chunks quarantined",
                                stats.quarantined,
                                stats.checked
                            );
                        } else {
                            log::debug!("inventory rescan: {found} chunks, all digests good");
                        }
                    }
                    Ok(Err(err)) => log::error!("inventory rescan failed - {err}"),
                    Err(err) => log::error!("inventory rescan panicked - {err}"),
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}
