//! Coordinator HTTP API under `/api/v1`.

use std::convert::Infallible;
use std::sync::Arc;

use anyhow::Error;
use hyper::server::conn::AddrIncoming;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use tokio::net::TcpListener;
use tokio::sync::watch;

use sfs_tools::http_bail;

use crate::server::formatter::{json_error_response, json_response};
use crate::server::{decode_path_param, parse_uuid, query_flag, query_map, read_json_body};

use super::{proxy, Coordinator};

/// Serves the API on an already-bound listener until `shutdown` fires.
/// Binding first lets callers use port 0 and read the real address back.
pub async fn serve(
    listener: TcpListener,
    coordinator: Arc<Coordinator>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Error> {
    let make_svc = make_service_fn(move |_conn| {
        let coordinator = Arc::clone(&coordinator);
        async move {
            Ok::<_, Infallible>(service_fn(move |request| {
                let coordinator = Arc::clone(&coordinator);
                async move { Ok::<_, Infallible>(handle_request(coordinator, request).await) }
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

async fn handle_request(coordinator: Arc<Coordinator>, request: Request<Body>) -> Response<Body> {
    match dispatch(coordinator, request).await {
        Ok(response) => response,
        Err(err) => json_error_response(err),
    }
}

async fn dispatch(
    coordinator: Arc<Coordinator>,
    request: Request<Body>,
) -> Result<Response<Body>, Error> {
    let (parts, body) = request.into_parts();
    let path = parts.uri.path().to_string();
    let query = query_map(&parts.uri);

    let rel = match path.strip_prefix("/api/v1") {
        Some(rel) => rel,
        None => http_bail!(NOT_FOUND, NotFound, "no such endpoint '{path}'"),
    };
    let segments: Vec<&str> = rel.split('/').filter(|s| !s.is_empty()).collect();

    match (parts.method.as_str(), segments.as_slice()) {
        ("POST", ["files", "upload-init"]) => {
            let request = read_json_body(body).await?;
            let plan = coordinator.upload_init(request).await?;
            Ok(json_response(Ok(serde_json::to_value(plan)?)))
        }

        ("POST", ["files", "commit"]) => {
            let request = read_json_body(body).await?;
            let response = coordinator.commit(request).await?;
            Ok(json_response(Ok(serde_json::to_value(response)?)))
        }

        ("GET", ["files"]) => {
            let prefix = query.get("prefix").map(|s| s.as_str());
            let limit = query.get("limit").and_then(|v| v.parse().ok());
            let offset = query.get("offset").and_then(|v| v.parse().ok());
            let files = coordinator.list_files(prefix, limit, offset).await?;
            Ok(json_response(Ok(serde_json::to_value(files)?)))
        }

        ("GET", ["files", tail @ ..]) if !tail.is_empty() => {
            let file_path = decode_path_param(&tail.join("/"))?;
            let record = coordinator.get_file(&file_path).await?;
            Ok(json_response(Ok(serde_json::to_value(record)?)))
        }

        ("DELETE", ["files", tail @ ..]) if !tail.is_empty() => {
            let file_path = decode_path_param(&tail.join("/"))?;
            let permanent = query_flag(&query, "permanent");
            let response = coordinator.delete_file(&file_path, permanent).await?;
            Ok(json_response(Ok(serde_json::to_value(response)?)))
        }

        ("POST", ["nodes", "heartbeat"]) => {
            let request = read_json_body(body).await?;
            let response = coordinator.heartbeat(request).await?;
            Ok(json_response(Ok(serde_json::to_value(response)?)))
        }

        ("GET", ["nodes"]) => {
            let nodes = coordinator.list_nodes().await;
            Ok(json_response(Ok(serde_json::to_value(nodes)?)))
        }

        ("GET", ["nodes", node_id]) => {
            let node = coordinator.get_node(node_id).await?;
            Ok(json_response(Ok(serde_json::to_value(node)?)))
        }

        ("POST", ["nodes", node_id, "decommission"]) => {
            let node = coordinator.decommission_node(node_id).await?;
            Ok(json_response(Ok(serde_json::to_value(node)?)))
        }

        ("GET", ["health"]) => {
            let health = coordinator.health().await;
            Ok(json_response(Ok(serde_json::to_value(health)?)))
        }

        ("PUT", ["proxy", "chunks", chunk_id]) => {
            let chunk_id = parse_uuid(chunk_id)?;
            let target_nodes = query.get("target_nodes").cloned().unwrap_or_default();
            let response = proxy::put(&coordinator, chunk_id, &target_nodes, body).await?;
            Ok(json_response(Ok(serde_json::to_value(response)?)))
        }

        ("GET", ["proxy", "chunks", chunk_id]) => {
            let chunk_id = parse_uuid(chunk_id)?;
            let file_path = query.get("file_path").map(|s| s.as_str());
            proxy::get(&coordinator, chunk_id, file_path).await
        }

        _ => http_bail!(NOT_FOUND, NotFound, "no such endpoint '{path}'"),
    }
}
