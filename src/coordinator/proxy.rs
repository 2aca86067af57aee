//! Coordinator-hosted chunk proxy.
//!
//! Clients behind NAT never address workers directly: on PUT the proxy
//! forwards the body to the first target worker with `replicate_to` set to
//! the remaining targets; on GET it picks a live replica round-robin and
//! streams the worker response straight through.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Error;
use hyper::{Body, Request, Response};
use uuid::Uuid;

use sfs_api_types::{ProxyPutResponse, PutChunkResponse, ReplicaPlacement, ReplicaState};
use sfs_tools::http::{error_kind, ErrorKind, HttpClient};
use sfs_tools::{http_bail, http_err};

use super::Coordinator;

pub async fn put(
    coordinator: &Arc<Coordinator>,
    chunk_id: Uuid,
    target_nodes: &str,
    body: Body,
) -> Result<ProxyPutResponse, Error> {
    let node_ids: Vec<&str> = target_nodes
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();
    if node_ids.is_empty() {
        http_bail!(BAD_REQUEST, BadRequest, "target_nodes is empty");
    }

    let urls = {
        let state = coordinator.state.read().await;
        let mut urls = Vec::with_capacity(node_ids.len());
        for node_id in &node_ids {
            match state.nodes.get(*node_id) {
                Some(node) => urls.push(node.url()),
                None => http_bail!(BAD_REQUEST, BadRequest, "unknown worker '{node_id}'"),
            }
        }
        urls
    };

    let mut uri = format!("{}/chunks/{chunk_id}", urls[0]);
    if urls.len() > 1 {
        let query = url::form_urlencoded::Serializer::new(String::new())
            .append_pair("replicate_to", &urls[1..].join("|"))
            .finish();
        uri = format!("{uri}?{query}");
    }

    let forward = Request::builder()
        .method("PUT")
        .uri(uri)
        .header(hyper::header::CONTENT_TYPE, "application/octet-stream")
        .body(body)?;

    let response = HttpClient::check_response(coordinator.http.request(forward).await?).await?;
    let data = hyper::body::to_bytes(response.into_body()).await?;
    let put: PutChunkResponse = serde_json::from_slice(&data)
        .map_err(|err| http_err!(BAD_GATEWAY, Internal, "bad worker response - {err}"))?;

    Ok(ProxyPutResponse {
        status: put.status,
        nodes: put.nodes,
    })
}

pub async fn get(
    coordinator: &Arc<Coordinator>,
    chunk_id: Uuid,
    file_path: Option<&str>,
) -> Result<Response<Body>, Error> {
    // chunk ids are globally unique; the path is for traffic correlation
    if let Some(file_path) = file_path {
        log::debug!("proxy GET chunk {chunk_id} for {file_path}");
    }

    let candidates = read_candidates(coordinator, chunk_id).await?;
    if candidates.is_empty() {
        http_bail!(NOT_FOUND, NotFound, "no live replica for chunk {chunk_id}");
    }

    let start = coordinator.proxy_rr.fetch_add(1, Ordering::Relaxed);
    let mut last_err: Option<Error> = None;

    for k in 0..candidates.len() {
        let replica = &candidates[(start + k) % candidates.len()];
        let uri = format!("{}/chunks/{chunk_id}", replica.url);

        let request = Request::builder()
            .method("GET")
            .uri(&uri)
            .body(Body::empty())?;
        let response = match coordinator.http.request(request).await {
            Ok(response) => response,
            Err(err) => {
                log::warn!("proxy: replica {} unreachable - {err:#}", replica.node_id);
                last_err = Some(err);
                continue;
            }
        };

        match HttpClient::check_response(response).await {
            Ok(upstream) => {
                let mut builder = Response::builder().status(hyper::StatusCode::OK);
                for header in ["content-length", "content-type", "x-checksum"] {
                    if let Some(value) = upstream.headers().get(header) {
                        builder = builder.header(header, value.clone());
                    }
                }
                return Ok(builder.body(upstream.into_body())?);
            }
            Err(err) => {
                if error_kind(&err) == Some(ErrorKind::Corrupted) {
                    coordinator
                        .mark_replica_corrupted(chunk_id, &replica.node_id)
                        .await;
                }
                log::warn!(
                    "proxy: replica {} failed for chunk {chunk_id} - {err:#}",
                    replica.node_id
                );
                last_err = Some(err);
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| http_err!(NOT_FOUND, NotFound, "chunk {chunk_id} not readable").into()))
}

/// Live replicas on active workers, committed ones first.
async fn read_candidates(
    coordinator: &Arc<Coordinator>,
    chunk_id: Uuid,
) -> Result<Vec<ReplicaPlacement>, Error> {
    let state = coordinator.state.read().await;
    let (_, chunk) = match state.find_chunk(chunk_id) {
        Some(found) => found,
        None => http_bail!(NOT_FOUND, NotFound, "chunk {chunk_id} not found"),
    };

    let mut candidates: Vec<ReplicaPlacement> = chunk
        .replicas
        .iter()
        .filter(|p| {
            p.is_live()
                && state
                    .nodes
                    .get(&p.node_id)
                    .map(|n| n.is_active())
                    .unwrap_or(false)
        })
        .cloned()
        .collect();
    candidates.sort_by_key(|p| p.state != ReplicaState::Committed);
    Ok(candidates)
}
