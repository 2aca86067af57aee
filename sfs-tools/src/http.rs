//! Plain-HTTP client plus the error type used at the HTTP edge.
//!
//! Swarmfs speaks unauthenticated HTTP/1.1 inside a trusted network, so this
//! is a thin wrapper around `hyper::Client` with JSON helpers and a uniform
//! error classification.

use std::fmt;
use std::time::Duration;

use anyhow::{format_err, Error};
use bytes::Bytes;
use hyper::client::HttpConnector;
use hyper::{Body, Client, Request, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;

use sfs_api_types::ErrorBody;

pub use http::StatusCode;
pub use sfs_api_types::ErrorKind;

/// Error with an HTTP status and a wire-level kind attached. Downcast from
/// `anyhow::Error` at the response formatter; the status mapping lives in
/// the code that constructs these, nowhere else.
#[derive(Clone, Debug)]
pub struct HttpError {
    pub code: StatusCode,
    pub kind: ErrorKind,
    pub message: String,
}

impl HttpError {
    pub fn new(code: StatusCode, kind: ErrorKind, message: String) -> Self {
        HttpError {
            code,
            kind,
            message,
        }
    }
}

impl fmt::Display for HttpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for HttpError {}

#[macro_export]
macro_rules! http_err {
    ($status:ident, $kind:ident, $($t:tt)+) => {
        $crate::http::HttpError::new(
            $crate::http::StatusCode::$status,
            $crate::http::ErrorKind::$kind,
            format!($($t)+),
        )
    };
}

#[macro_export]
macro_rules! http_bail {
    ($status:ident, $kind:ident, $($t:tt)+) => {
        return Err($crate::http_err!($status, $kind, $($t)+).into())
    };
}

/// Kind attached to `err`, if it is an [`HttpError`].
pub fn error_kind(err: &Error) -> Option<ErrorKind> {
    err.downcast_ref::<HttpError>().map(|e| e.kind)
}

/// Retry predicate shared by the client upload loop and the worker fan-out:
/// errors without a kind (connection refused, timeouts, torn bodies) count
/// as transient.
pub fn is_transient(err: &Error) -> bool {
    match error_kind(err) {
        Some(kind) => kind.is_retriable(),
        None => true,
    }
}

const MAX_ERROR_BODY: usize = 64 * 1024;
const MAX_JSON_BODY: usize = 64 * 1024 * 1024;

#[derive(Clone)]
pub struct HttpClient {
    client: Client<HttpConnector, Body>,
    timeout: Duration,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Client::builder().build_http(),
            timeout,
        }
    }

    /// Sends a request. The timeout covers connecting and the response head,
    /// not the body transfer; callers streaming large bodies put their own
    /// deadline around the whole exchange.
    pub async fn request(&self, request: Request<Body>) -> Result<Response<Body>, Error> {
        let uri = request.uri().clone();
        match tokio::time::timeout(self.timeout, self.client.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(err)) => Err(http_err!(
                SERVICE_UNAVAILABLE,
                Unreachable,
                "request to {uri} failed - {err}"
            )
            .into()),
            Err(_) => Err(http_err!(
                SERVICE_UNAVAILABLE,
                Unreachable,
                "request to {uri} timed out"
            )
            .into()),
        }
    }

    /// Turns a non-success response into an [`HttpError`], decoding the
    /// `{error, kind}` payload when the peer sent one.
    pub async fn check_response(response: Response<Body>) -> Result<Response<Body>, Error> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = hyper::body::to_bytes(response.into_body())
            .await
            .unwrap_or_default();
        let body = &body[..body.len().min(MAX_ERROR_BODY)];

        let (kind, message) = match serde_json::from_slice::<ErrorBody>(body) {
            Ok(err) => (err.kind.unwrap_or_else(|| default_kind(status)), err.error),
            Err(_) => (
                default_kind(status),
                String::from_utf8_lossy(body).into_owned(),
            ),
        };

        Err(HttpError::new(status, kind, format!("{status}: {message}")).into())
    }

    pub async fn get_json<T: DeserializeOwned>(&self, uri: &str) -> Result<T, Error> {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())?;
        let response = Self::check_response(self.request(request).await?).await?;
        Self::json_body(response).await
    }

    pub async fn post_json<B: Serialize, T: DeserializeOwned>(
        &self,
        uri: &str,
        body: &B,
    ) -> Result<T, Error> {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(hyper::header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(body)?))?;
        let response = Self::check_response(self.request(request).await?).await?;
        Self::json_body(response).await
    }

    /// PUT an opaque byte body, decode the JSON reply.
    pub async fn put_bytes<T: DeserializeOwned>(&self, uri: &str, data: Bytes) -> Result<T, Error> {
        let request = Request::builder()
            .method("PUT")
            .uri(uri)
            .header(hyper::header::CONTENT_TYPE, "application/octet-stream")
            .body(Body::from(data))?;
        let response = Self::check_response(self.request(request).await?).await?;
        Self::json_body(response).await
    }

    pub async fn get_bytes(&self, uri: &str) -> Result<Bytes, Error> {
        let request = Request::builder()
            .method("GET")
            .uri(uri)
            .body(Body::empty())?;
        let response = Self::check_response(self.request(request).await?).await?;
        Ok(hyper::body::to_bytes(response.into_body()).await?)
    }

    pub async fn delete(&self, uri: &str) -> Result<(), Error> {
        let request = Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())?;
        Self::check_response(self.request(request).await?).await?;
        Ok(())
    }

    pub async fn delete_json<T: DeserializeOwned>(&self, uri: &str) -> Result<T, Error> {
        let request = Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())?;
        let response = Self::check_response(self.request(request).await?).await?;
        Self::json_body(response).await
    }

    async fn json_body<T: DeserializeOwned>(response: Response<Body>) -> Result<T, Error> {
        let data = hyper::body::to_bytes(response.into_body()).await?;
        if data.len() > MAX_JSON_BODY {
            return Err(format_err!("response body too large ({} bytes)", data.len()));
        }
        serde_json::from_slice(&data)
            .map_err(|err| format_err!("unable to decode response body - {err}"))
    }
}

fn default_kind(status: StatusCode) -> ErrorKind {
    if status == StatusCode::NOT_FOUND {
        ErrorKind::NotFound
    } else if status == StatusCode::CONFLICT {
        ErrorKind::PathConflict
    } else if status.is_server_error() {
        ErrorKind::Internal
    } else {
        ErrorKind::BadRequest
    }
}
