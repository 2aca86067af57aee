//! Worker HTTP API: chunk transfer plus health, no prefix.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Error;
use hyper::server::conn::AddrIncoming;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;

use sfs_api_types::ReplicateRequest;
use sfs_tools::http_bail;

use crate::server::formatter::{json_error_response, json_response};
use crate::server::{parse_uuid, query_map, read_json_body};

use super::Worker;

pub async fn serve(
    listener: TcpListener,
    worker: Arc<Worker>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    let make_svc = make_service_fn(move |_conn| {
        let worker = Arc::clone(&worker);
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                let worker = Arc::clone(&worker);
                async move { Ok::<_, Infallible>(handle_request(worker, request).await) }
            }))
        }
    });

    Server::builder(AddrIncoming::from_listener(listener)?)
        .serve(make_svc)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;
    Ok(())
}

async fn handle_request(worker: Arc<Worker>, request: Request<Body>) -> Response<Body> {
    match dispatch(worker, request).await {
        Ok(response) => response,
        Err(err) => json_error_response(err),
    }
}

async fn dispatch(worker: Arc<Worker>, request: Request<Body>) -> Result<Response<Body>, Error> {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let query = query_map(&parts.uri);
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();

    match (parts.method.as_str(), segments.as_slice()) {
        ("PUT", ["chunks", chunk_id]) => {
            let chunk_id = parse_uuid(chunk_id)?;
            let replicate_to: Vec<String> = query
                .get("replicate_to")
                .map(|raw| {
                    raw.split('|')
                        .map(|s| s.trim())
                        .filter(|s| !s.is_empty())
                        .map(|s| s.to_string())
                        .collect()
                })
                .unwrap_or_default();
            let response = worker.put_chunk(chunk_id, body, replicate_to).await?;
            Ok(json_response(Ok(serde_json::to_value(response)?)))
        }

        ("GET", ["chunks", chunk_id]) => {
            let chunk_id = parse_uuid(chunk_id)?;
            let (data, checksum) = worker.get_chunk(chunk_id)?;
            Ok(Response::builder()
                .status(hyper::StatusCode::OK)
                .header(hyper::header::CONTENT_TYPE, "application/octet-stream")
                .header(hyper::header::CONTENT_LENGTH, data.len())
                .header("X-Checksum", checksum)
                .body(Body::from(data))?)
        }

        ("DELETE", ["chunks", chunk_id]) => {
            let chunk_id = parse_uuid(chunk_id)?;
            worker.delete_chunk(chunk_id)?;
            Ok(json_response(Ok(json!({ "status": "deleted" }))))
        }

        ("POST", ["chunks", chunk_id, "replicate"]) => {
            let chunk_id = parse_uuid(chunk_id)?;
            let request: ReplicateRequest = read_json_body(body).await?;
            let response = worker.replicate(chunk_id, &request.target_url).await?;
            Ok(json_response(Ok(serde_json::to_value(response)?)))
        }

        ("GET", ["health"]) => {
            let health = worker.health()?;
            Ok(json_response(Ok(serde_json::to_value(health)?)))
        }

        _ => http_bail!(NOT_FOUND, NotFound, "no such endpoint '{path}'"),
    }
}
