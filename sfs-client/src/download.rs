use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{bail, format_err, Error};
use futures::stream::{StreamExt, TryStreamExt};

use sfs_api_types::{ChunkRecord, FileRecord};
use sfs_tools::digest::sha256_hex;
use sfs_tools::http_err;

use crate::Client;

#[derive(Clone, Debug)]
pub struct DownloadOptions {
    /// Concurrent chunk fetches; downloads tolerate more parallelism than
    /// uploads since nothing fans out behind them.
    pub concurrency: usize,
    /// Fetch through the coordinator proxy instead of addressing workers
    /// directly. The proxy is the supported path for clients behind NAT.
    pub use_proxy: bool,
    pub chunk_timeout: Duration,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            concurrency: 8,
            use_proxy: true,
            chunk_timeout: Duration::from_secs(120),
        }
    }
}

pub(crate) async fn download_record(
    client: &Client,
    record: &FileRecord,
    opts: &DownloadOptions,
) -> Result<Vec<u8>, Error> {
    let mut chunks: Vec<&ChunkRecord> = record.chunks.iter().collect();
    chunks.sort_by_key(|c| c.index);

    let mut offsets = Vec::with_capacity(chunks.len());
    let mut total = 0u64;
    for chunk in &chunks {
        offsets.push(total);
        total += chunk.size;
    }
    if total != record.size {
        bail!(
            "file {} metadata inconsistent - chunks cover {total} of {} bytes",
            record.path,
            record.size
        );
    }

    // per-download failure counts; a replica failing twice is skipped
    let failures = Mutex::new(HashMap::<String, u32>::new());
    let failures = &failures;

    let fetches = chunks
        .iter()
        .zip(offsets)
        .map(|(&chunk, offset)| async move {
            let data = fetch_chunk(client, record, chunk, opts, failures).await?;
            Ok::<_, Error>((offset, data))
        });

    let parts: Vec<(u64, Vec<u8>)> = futures::stream::iter(fetches)
        .buffer_unordered(opts.concurrency.max(1))
        .try_collect()
        .await?;

    let mut out = vec![0u8; record.size as usize];
    for (offset, data) in parts {
        out[offset as usize..offset as usize + data.len()].copy_from_slice(&data);
    }
    Ok(out)
}

/// Fetches and verifies one chunk, failing over across replicas until one
/// yields bytes matching the recorded digest.
async fn fetch_chunk(
    client: &Client,
    record: &FileRecord,
    chunk: &ChunkRecord,
    opts: &DownloadOptions,
    failures: &Mutex<HashMap<String, u32>>,
) -> Result<Vec<u8>, Error> {
    let checksum = chunk
        .checksum
        .as_deref()
        .ok_or_else(|| format_err!("chunk {} has no recorded checksum", chunk.chunk_id))?;

    let mut last_err: Option<Error> = None;

    if opts.use_proxy {
        // the proxy rotates replicas itself; give it one try per replica
        // plus one, so a single corrupt copy cannot exhaust the attempts
        let attempts = chunk.replicas.len().max(1) + 1;
        for _ in 0..attempts {
            match fetch_via_proxy(client, record, chunk, checksum, opts).await {
                Ok(data) => return Ok(data),
                Err(err) => {
                    log::warn!("proxy fetch of chunk {} failed - {err:#}", chunk.chunk_id);
                    last_err = Some(err);
                }
            }
        }
    } else {
        for replica in &chunk.replicas {
            let skipped = failures
                .lock()
                .unwrap()
                .get(&replica.node_id)
                .map_or(false, |n| *n >= 2);
            if skipped {
                continue;
            }

            match fetch_from_replica(client, replica.url.as_str(), chunk, checksum, opts).await {
                Ok(data) => return Ok(data),
                Err(err) => {
                    log::warn!(
                        "replica {} failed for chunk {} - {err:#}",
                        replica.node_id,
                        chunk.chunk_id
                    );
                    *failures
                        .lock()
                        .unwrap()
                        .entry(replica.node_id.clone())
                        .or_insert(0) += 1;
                    last_err = Some(err);
                }
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        http_err!(
            NOT_FOUND,
            NotFound,
            "no live replica for chunk {}",
            chunk.chunk_id
        )
        .into()
    }))
}

async fn fetch_via_proxy(
    client: &Client,
    record: &FileRecord,
    chunk: &ChunkRecord,
    checksum: &str,
    opts: &DownloadOptions,
) -> Result<Vec<u8>, Error> {
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("file_path", &record.path)
        .finish();
    let uri = format!(
        "{}?{query}",
        client.api_url(&format!("/proxy/chunks/{}", chunk.chunk_id))
    );
    fetch_and_verify(client, &uri, chunk, checksum, opts).await
}

async fn fetch_from_replica(
    client: &Client,
    base_url: &str,
    chunk: &ChunkRecord,
    checksum: &str,
    opts: &DownloadOptions,
) -> Result<Vec<u8>, Error> {
    let uri = format!("{}/chunks/{}", base_url.trim_end_matches('/'), chunk.chunk_id);
    fetch_and_verify(client, &uri, chunk, checksum, opts).await
}

async fn fetch_and_verify(
    client: &Client,
    uri: &str,
    chunk: &ChunkRecord,
    checksum: &str,
    opts: &DownloadOptions,
) -> Result<Vec<u8>, Error> {
    let data = match tokio::time::timeout(opts.chunk_timeout, client.http().get_bytes(uri)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(http_err!(
                SERVICE_UNAVAILABLE,
                Unreachable,
                "chunk {} GET timed out after {:?}",
                chunk.chunk_id,
                opts.chunk_timeout
            )
            .into())
        }
    };

    if data.len() as u64 != chunk.size {
        bail!(
            "chunk {}: got {} bytes, expected {}",
            chunk.chunk_id,
            data.len(),
            chunk.size
        );
    }

    let computed = sha256_hex(&data);
    if computed != checksum {
        bail!(
            "chunk {}: digest mismatch - got {computed}, recorded {checksum}",
            chunk.chunk_id
        );
    }

    Ok(data.to_vec())
}
