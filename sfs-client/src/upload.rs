use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{bail, format_err, Error};
use bytes::Bytes;
use futures::stream::{StreamExt, TryStreamExt};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use uuid::Uuid;

use sfs_api_types::{
    ChunkPlan, CommitChunk, CommitRequest, CommitResponse, ProxyPutResponse, PutChunkResponse,
    UploadInitRequest, UploadPlan,
};
use sfs_tools::digest::sha256_hex;
use sfs_tools::http::is_transient;
use sfs_tools::http_err;
use sfs_tools::retry::{retry, RetryOpts};

use crate::Client;

#[derive(Clone, Debug)]
pub struct UploadOptions {
    pub overwrite: bool,
    /// Opaque to the core; forwarded to the coordinator as-is.
    pub compressed: bool,
    pub original_size: Option<u64>,
    /// Concurrent chunk transfers per upload.
    pub concurrency: usize,
    /// Deadline for one chunk PUT attempt, generous enough for slow links.
    pub chunk_timeout: Duration,
    pub retry: RetryOpts,
    /// PUT straight to the primary worker instead of the coordinator proxy.
    /// Only useful for clients that can reach the workers directly.
    pub direct: bool,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            overwrite: false,
            compressed: false,
            original_size: None,
            concurrency: 4,
            chunk_timeout: Duration::from_secs(120),
            retry: RetryOpts::default(),
            direct: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct UploadStats {
    pub file_id: Uuid,
    pub size: u64,
    pub chunks: usize,
    pub duration: Duration,
}

/// Where chunk bytes come from. File sources reread their slice on every
/// attempt, so a retry after a timeout always ships fresh bytes.
pub enum ChunkSource {
    Memory(Bytes),
    File(PathBuf),
}

impl ChunkSource {
    async fn read_slice(&self, offset: u64, len: u64) -> Result<Bytes, Error> {
        match self {
            ChunkSource::Memory(data) => {
                let end = (offset + len) as usize;
                if end > data.len() {
                    bail!("chunk slice {offset}..{end} out of bounds");
                }
                Ok(data.slice(offset as usize..end))
            }
            ChunkSource::File(path) => {
                let mut file = tokio::fs::File::open(path)
                    .await
                    .map_err(|err| format_err!("unable to open {path:?} - {err}"))?;
                file.seek(SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len as usize];
                file.read_exact(&mut buf)
                    .await
                    .map_err(|err| format_err!("short read from {path:?} - {err}"))?;
                Ok(buf.into())
            }
        }
    }
}

pub(crate) async fn upload(
    client: &Client,
    path: &str,
    source: ChunkSource,
    size: u64,
    opts: &UploadOptions,
) -> Result<UploadStats, Error> {
    let start = Instant::now();

    let plan: UploadPlan = client
        .http()
        .post_json(
            &client.api_url("/files/upload-init"),
            &UploadInitRequest {
                path: path.to_string(),
                size,
                overwrite: opts.overwrite,
                compressed: opts.compressed,
                original_size: opts.original_size,
            },
        )
        .await?;

    let planned: u64 = plan.chunks.iter().map(|c| c.size).sum();
    if planned != size {
        bail!("upload plan covers {planned} bytes, expected {size}");
    }

    // the coordinator's chunk size is authoritative; slice with it
    let chunk_size = plan.chunk_size;
    let source = &source;
    let transfers = plan.chunks.iter().map(|chunk| async move {
        let offset = chunk.index as u64 * chunk_size;
        let data = source.read_slice(offset, chunk.size).await?;
        // hash once; retries reuse the digest, never recompute per attempt
        let checksum = sha256_hex(&data);

        let nodes = retry("chunk upload", &opts.retry, is_transient, || {
            let data = data.clone();
            let checksum = checksum.as_str();
            async move { put_chunk(client, chunk, data, checksum, opts).await }
        })
        .await
        .map_err(|err| {
            format_err!("upload of chunk {} (index {}) failed - {err:#}", chunk.chunk_id, chunk.index)
        })?;

        Ok::<_, Error>(CommitChunk {
            chunk_id: chunk.chunk_id,
            checksum,
            nodes,
        })
    });

    let chunks: Vec<CommitChunk> = futures::stream::iter(transfers)
        .buffer_unordered(opts.concurrency.max(1))
        .try_collect()
        .await?;

    let committed: CommitResponse = client
        .http()
        .post_json(
            &client.api_url("/files/commit"),
            &CommitRequest {
                file_id: plan.file_id,
                chunks,
            },
        )
        .await?;

    log::debug!("uploaded {path} ({size} bytes, {} chunks)", plan.chunks.len());

    Ok(UploadStats {
        file_id: committed.file_id,
        size,
        chunks: plan.chunks.len(),
        duration: start.elapsed(),
    })
}

/// One PUT attempt for one chunk, either through the coordinator proxy or
/// directly to the primary worker which fans out to its peers.
async fn put_chunk(
    client: &Client,
    chunk: &ChunkPlan,
    data: Bytes,
    checksum: &str,
    opts: &UploadOptions,
) -> Result<Vec<String>, Error> {
    let attempt = async {
        if opts.direct {
            let primary = chunk
                .targets
                .first()
                .ok_or_else(|| format_err!("chunk {} has no targets", chunk.chunk_id))?;
            let mut uri = format!("{}/chunks/{}", primary.trim_end_matches('/'), chunk.chunk_id);
            if chunk.targets.len() > 1 {
                let query = url::form_urlencoded::Serializer::new(String::new())
                    .append_pair("replicate_to", &chunk.targets[1..].join("|"))
                    .finish();
                uri = format!("{uri}?{query}");
            }

            let response: PutChunkResponse = client.http().put_bytes(&uri, data).await?;
            if response.checksum != checksum {
                bail!(
                    "worker stored digest {} for chunk {}, expected {checksum}",
                    response.checksum,
                    chunk.chunk_id
                );
            }
            Ok(response.nodes)
        } else {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .append_pair("target_nodes", &chunk.nodes.join(","))
                .finish();
            let uri = format!(
                "{}?{query}",
                client.api_url(&format!("/proxy/chunks/{}", chunk.chunk_id))
            );

            let response: ProxyPutResponse = client.http().put_bytes(&uri, data).await?;
            if response.nodes.is_empty() {
                bail!("no worker acknowledged chunk {}", chunk.chunk_id);
            }
            Ok(response.nodes)
        }
    };

    match tokio::time::timeout(opts.chunk_timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(http_err!(
            SERVICE_UNAVAILABLE,
            Unreachable,
            "chunk {} PUT timed out after {:?}",
            chunk.chunk_id,
            opts.chunk_timeout
        )
        .into()),
    }
}
