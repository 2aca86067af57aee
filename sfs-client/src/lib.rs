//! Client library for swarmfs.
//!
//! Uploads run in three phases: `upload-init` on the coordinator, parallel
//! chunk PUTs with retries, then `commit`. Downloads fetch chunks in
//! parallel and verify every chunk against its recorded SHA-256 before
//! reassembly, so a successful transfer is byte-exact end to end.

use std::path::Path;
use std::time::Duration;

use anyhow::{format_err, Error};
use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};

use sfs_api_types::{DeleteResponse, FileRecord, HealthResponse};
use sfs_tools::http::HttpClient;

mod download;
mod upload;

pub use download::DownloadOptions;
pub use upload::{ChunkSource, UploadOptions, UploadStats};

#[derive(Clone)]
pub struct Client {
    http: HttpClient,
    base: String,
}

impl Client {
    pub fn new(coordinator_url: &str) -> Self {
        Self::with_timeout(coordinator_url, Duration::from_secs(30))
    }

    pub fn with_timeout(coordinator_url: &str, timeout: Duration) -> Self {
        Self {
            http: HttpClient::new(timeout),
            base: coordinator_url.trim_end_matches('/').to_string(),
        }
    }

    pub(crate) fn http(&self) -> &HttpClient {
        &self.http
    }

    pub(crate) fn api_url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base, path)
    }

    pub(crate) fn file_url(&self, path: &str) -> String {
        self.api_url(&format!(
            "/files/{}",
            utf8_percent_encode(path, NON_ALPHANUMERIC)
        ))
    }

    pub async fn health(&self) -> Result<HealthResponse, Error> {
        self.http.get_json(&self.api_url("/health")).await
    }

    /// Lists non-deleted files, optionally restricted to a path prefix.
    pub async fn list(&self, prefix: Option<&str>) -> Result<Vec<FileRecord>, Error> {
        let mut uri = self.api_url("/files");
        if let Some(prefix) = prefix {
            let query = url::form_urlencoded::Serializer::new(String::new())
                .append_pair("prefix", prefix)
                .finish();
            uri = format!("{uri}?{query}");
        }
        self.http.get_json(&uri).await
    }

    /// Fetches a file record with its chunk list and live replicas.
    pub async fn get(&self, path: &str) -> Result<FileRecord, Error> {
        self.http.get_json(&self.file_url(path)).await
    }

    pub async fn delete(&self, path: &str, permanent: bool) -> Result<DeleteResponse, Error> {
        let mut uri = self.file_url(path);
        if permanent {
            uri.push_str("?permanent=true");
        }
        self.http.delete_json(&uri).await
    }

    /// Uploads an in-memory byte sequence.
    pub async fn upload_bytes(
        &self,
        path: &str,
        data: Bytes,
        opts: &UploadOptions,
    ) -> Result<UploadStats, Error> {
        let size = data.len() as u64;
        upload::upload(self, path, ChunkSource::Memory(data), size, opts).await
    }

    /// Uploads a local file. Chunk slices are read from disk on demand, so
    /// a retried chunk rereads fresh bytes from the source.
    pub async fn upload_file<P: AsRef<Path>>(
        &self,
        path: &str,
        local: P,
        opts: &UploadOptions,
    ) -> Result<UploadStats, Error> {
        let local = local.as_ref().to_owned();
        let size = tokio::fs::metadata(&local)
            .await
            .map_err(|err| format_err!("unable to stat {local:?} - {err}"))?
            .len();
        upload::upload(self, path, ChunkSource::File(local), size, opts).await
    }

    /// Downloads a file and returns its bytes in order.
    pub async fn download(&self, path: &str, opts: &DownloadOptions) -> Result<Vec<u8>, Error> {
        let record = self.get(path).await?;
        download::download_record(self, &record, opts).await
    }

    /// Downloads a file to a local path.
    pub async fn download_to_file<P: AsRef<Path>>(
        &self,
        path: &str,
        local: P,
        opts: &DownloadOptions,
    ) -> Result<u64, Error> {
        let data = self.download(path, opts).await?;
        let len = data.len() as u64;
        tokio::fs::write(local.as_ref(), data)
            .await
            .map_err(|err| format_err!("unable to write {:?} - {err}", local.as_ref()))?;
        Ok(len)
    }
}

