//! Shared pieces of the two HTTP daemons: body/query parsing helpers and
//! the JSON response formatter. Routing itself is a plain match over
//! `(method, path segments)` in each daemon's `rest` module.

pub mod formatter;

use std::collections::HashMap;

use anyhow::Error;
use hyper::{Body, Uri};
use serde::de::DeserializeOwned;
use uuid::Uuid;

use sfs_tools::{http_bail, http_err};

const MAX_REQUEST_BODY: usize = 16 * 1024 * 1024;

pub async fn read_json_body<T: DeserializeOwned>(body: Body) -> Result<T, Error> {
    let data = hyper::body::to_bytes(body).await?;
    if data.len() > MAX_REQUEST_BODY {
        http_bail!(
            BAD_REQUEST,
            BadRequest,
            "request body too large ({} bytes)",
            data.len()
        );
    }
    serde_json::from_slice(&data)
        .map_err(|err| http_err!(BAD_REQUEST, BadRequest, "unable to parse request - {err}").into())
}

pub fn query_map(uri: &Uri) -> HashMap<String, String> {
    match uri.query() {
        Some(query) => url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect(),
        None => HashMap::new(),
    }
}

pub fn query_flag(query: &HashMap<String, String>, name: &str) -> bool {
    matches!(
        query.get(name).map(|v| v.as_str()),
        Some("1") | Some("true") | Some("yes")
    )
}

pub fn parse_uuid(raw: &str) -> Result<Uuid, Error> {
    raw.parse()
        .map_err(|_| http_err!(BAD_REQUEST, BadRequest, "invalid id '{raw}'").into())
}

/// Decodes the url-encoded file path tail of a request path. A decoded
/// value without a leading slash gets one, so `/files/%2Fa` and `/files/a`
/// both address `/a`.
pub fn decode_path_param(raw: &str) -> Result<String, Error> {
    let decoded = percent_encoding::percent_decode_str(raw)
        .decode_utf8()
        .map_err(|err| http_err!(BAD_REQUEST, BadRequest, "malformed path encoding - {err}"))?;
    if decoded.starts_with('/') {
        Ok(decoded.into_owned())
    } else {
        Ok(format!("/{decoded}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_path_param() {
        assert_eq!(decode_path_param("%2Fa").unwrap(), "/a");
        assert_eq!(decode_path_param("a").unwrap(), "/a");
        assert_eq!(decode_path_param("a%2Fb%2Fc").unwrap(), "/a/b/c");
        assert_eq!(decode_path_param("dir/file.bin").unwrap(), "/dir/file.bin");
        assert!(decode_path_param("%ff").is_err());
    }

    #[test]
    fn test_query_map() {
        let uri: Uri = "http://x/files?prefix=%2Fa&limit=10".parse().unwrap();
        let query = query_map(&uri);
        assert_eq!(query.get("prefix").map(|s| s.as_str()), Some("/a"));
        assert_eq!(query.get("limit").map(|s| s.as_str()), Some("10"));
        assert!(!query_flag(&query, "permanent"));
    }
}
