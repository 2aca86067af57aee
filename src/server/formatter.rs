use anyhow::Error;
use serde_json::Value;

use hyper::header;
use hyper::{Body, Response, StatusCode};

use sfs_api_types::{ErrorBody, ErrorKind};
use sfs_tools::http::HttpError;

static JSON_CONTENT_TYPE: &str = "application/json;charset=UTF-8";

fn json_body_response(status: StatusCode, raw: Vec<u8>) -> Response<Body> {
    let mut response = Response::new(raw.into());
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static(JSON_CONTENT_TYPE),
    );
    response
}

/// Serializes a handler result. Success bodies are the payload itself,
/// nothing wrapped around them.
pub fn json_response(result: Result<Value, Error>) -> Response<Body> {
    match result {
        Ok(data) => json_body_response(StatusCode::OK, data.to_string().into_bytes()),
        Err(err) => json_error_response(err),
    }
}

/// The one place mapping errors onto HTTP: an [`HttpError`] keeps its
/// status and kind, anything else is an internal server error. The body is
/// the `{error, kind}` payload clients classify retries by.
pub fn json_error_response(err: Error) -> Response<Body> {
    let (status, kind, message) = match err.downcast_ref::<HttpError>() {
        Some(http_err) => (http_err.code, http_err.kind, http_err.message.clone()),
        None => (
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::Internal,
            format!("{err:#}"),
        ),
    };

    let body = ErrorBody {
        error: message,
        kind: Some(kind),
    };
    let raw = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());

    json_body_response(status, raw)
}
