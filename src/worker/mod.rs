//! The storage worker: stores and serves opaque chunks by id, reports its
//! inventory truthfully and fans new writes out to peers when asked.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Error;
use bytes::Bytes;
use futures::StreamExt;
use hyper::Body;

use sfs_api_types::{PutChunkResponse, ReplicateResponse, WorkerHealthResponse};
use sfs_chunkstore::{ChunkStore, ChunkStoreError};
use sfs_tools::http::{is_transient, HttpClient, HttpError, StatusCode};
use sfs_tools::http_err;
use sfs_tools::retry::{retry, RetryOpts};
use uuid::Uuid;

use crate::config::WorkerConfig;

pub mod heartbeat;
pub mod rest;

pub struct Worker {
    pub config: WorkerConfig,
    node_id: String,
    store: Arc<ChunkStore>,
    http: HttpClient,
    retry: RetryOpts,
}

impl Worker {
    pub fn new(config: WorkerConfig) -> Result<Arc<Self>, Error> {
        let store = Arc::new(ChunkStore::open(&config.storage_path)?);
        let node_id = config.node_id();
        log::info!(
            "worker {node_id}: {} chunks in {:?}",
            store.chunk_count(),
            config.storage_path
        );
        Ok(Arc::new(Self {
            node_id,
            store,
            http: HttpClient::new(Duration::from_secs(120)),
            retry: RetryOpts::default(),
            config,
        }))
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn store(&self) -> &Arc<ChunkStore> {
        &self.store
    }

    /// Streams an incoming body into the store, then forwards the chunk to
    /// each `replicate_to` peer in parallel. Peer failures shrink the
    /// acknowledged node set but never fail the call; the repair loop heals
    /// missing copies later.
    pub async fn put_chunk(
        &self,
        chunk_id: Uuid,
        body: Body,
        replicate_to: Vec<String>,
    ) -> Result<PutChunkResponse, Error> {
        let existing = self.store.stored_digest(chunk_id).map_err(store_err)?;

        let (size, checksum) = match existing {
            Some(digest) => {
                // chunks are immutable: drain and discard the body
                let mut body = body;
                while let Some(frame) = body.next().await {
                    if frame.is_err() {
                        break;
                    }
                }
                let size = self.store.chunk_size(chunk_id).unwrap_or(0);
                log::debug!("chunk {chunk_id} already stored, keeping existing bytes");
                (size, digest)
            }
            None => {
                let mut writer = self.store.create_writer(chunk_id).map_err(store_err)?;
                let mut body = body;
                let mut failure: Option<Error> = None;

                while let Some(frame) = body.next().await {
                    match frame {
                        Ok(data) => {
                            if let Err(err) = writer.write(&data) {
                                failure = Some(store_err(err));
                                break;
                            }
                        }
                        Err(err) => {
                            failure = Some(
                                http_err!(
                                    BAD_REQUEST,
                                    BadRequest,
                                    "request body for chunk {chunk_id} failed - {err}"
                                )
                                .into(),
                            );
                            break;
                        }
                    }
                }

                match failure {
                    Some(err) => {
                        writer.abort();
                        return Err(err);
                    }
                    None => self.store.finish_writer(writer).map_err(store_err)?,
                }
            }
        };

        let mut nodes = vec![self.node_id.clone()];
        if !replicate_to.is_empty() {
            // reread from disk: verified bytes, and the body is gone
            let (data, _) = self.store.read_chunk(chunk_id).map_err(store_err)?;
            nodes.extend(self.fan_out(chunk_id, Bytes::from(data), &replicate_to).await);
        }

        Ok(PutChunkResponse {
            status: "ok".to_string(),
            chunk_id,
            size,
            checksum,
            nodes,
        })
    }

    async fn fan_out(&self, chunk_id: Uuid, data: Bytes, peers: &[String]) -> Vec<String> {
        let transfers = peers.iter().map(|peer| {
            let peer = peer.trim_end_matches('/').to_string();
            let data = data.clone();
            async move {
                let uri = format!("{peer}/chunks/{chunk_id}");
                let result = retry("chunk fan-out", &self.retry, is_transient, || {
                    let uri = uri.clone();
                    let data = data.clone();
                    async move {
                        self.http
                            .put_bytes::<PutChunkResponse>(&uri, data)
                            .await
                    }
                })
                .await;

                match result {
                    Ok(response) => Some(response.nodes),
                    Err(err) => {
                        log::warn!("fan-out of chunk {chunk_id} to {peer} failed - {err:#}");
                        None
                    }
                }
            }
        });

        futures::future::join_all(transfers)
            .await
            .into_iter()
            .flatten()
            .flatten()
            .collect()
    }

    /// Verified chunk bytes plus their digest. A digest mismatch has
    /// already quarantined the pair by the time the error surfaces.
    pub fn get_chunk(&self, chunk_id: Uuid) -> Result<(Vec<u8>, String), Error> {
        self.store.read_chunk(chunk_id).map_err(store_err)
    }

    pub fn delete_chunk(&self, chunk_id: Uuid) -> Result<(), Error> {
        self.store.remove_chunk(chunk_id).map_err(store_err)
    }

    /// Acts as a client for the repair loop: reads the local chunk and PUTs
    /// it to the destination worker.
    pub async fn replicate(
        &self,
        chunk_id: Uuid,
        target_url: &str,
    ) -> Result<ReplicateResponse, Error> {
        let (data, _) = self.store.read_chunk(chunk_id).map_err(store_err)?;
        let data = Bytes::from(data);
        let uri = format!("{}/chunks/{chunk_id}", target_url.trim_end_matches('/'));

        retry("chunk replicate", &self.retry, is_transient, || {
            let uri = uri.clone();
            let data = data.clone();
            async move { self.http.put_bytes::<PutChunkResponse>(&uri, data).await }
        })
        .await?;

        log::info!("replicated chunk {chunk_id} to {target_url}");
        Ok(ReplicateResponse {
            status: "ok".to_string(),
            chunk_id,
        })
    }

    pub fn health(&self) -> Result<WorkerHealthResponse, Error> {
        let (free_space, total_space) = self.store.usage().map_err(store_err)?;
        Ok(WorkerHealthResponse {
            status: "ok".to_string(),
            node_id: self.node_id.clone(),
            free_space,
            total_space,
            chunk_count: self.store.chunk_count(),
        })
    }
}

/// Maps store failures onto the HTTP edge; the status table of the worker
/// API lives here.
fn store_err(err: ChunkStoreError) -> Error {
    let (code, kind) = match &err {
        ChunkStoreError::NotFound(_) => (StatusCode::NOT_FOUND, sfs_api_types::ErrorKind::NotFound),
        ChunkStoreError::Corrupted { .. } => (
            StatusCode::INTERNAL_SERVER_ERROR,
            sfs_api_types::ErrorKind::Corrupted,
        ),
        ChunkStoreError::NoSpace => (
            StatusCode::SERVICE_UNAVAILABLE,
            sfs_api_types::ErrorKind::NoSpace,
        ),
        ChunkStoreError::Io(_) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            sfs_api_types::ErrorKind::IoError,
        ),
    };
    HttpError::new(code, kind, err.to_string()).into()
}
