//! Read-only request/response metadata attached to transactions and errors.
//!
//! Building a snapshot never fails outright: a URL that cannot be
//! reconstructed degrades to its raw form, with the reason logged.

use std::collections::BTreeMap;

use http::header::{CONTENT_TYPE, HOST};
use http::{HeaderMap, Uri};
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::config::WildcardSet;
use crate::request::RequestHead;
use crate::response::Response;

const REDACTED: &str = "[REDACTED]";
const FORWARDED_PROTO: &str = "x-forwarded-proto";

#[derive(Debug, thiserror::Error)]
pub(crate) enum SnapshotError {
    #[error("request has neither an absolute uri nor a host header")]
    MissingHost,
    #[error("host header is not valid utf-8")]
    HostEncoding,
    #[error("cannot rebuild url `{url}`: {source}")]
    InvalidUrl { url: String, source: http::uri::InvalidUri },
}

#[derive(Debug, Serialize)]
struct UrlSnapshot {
    raw: String,
    #[serde(flatten)]
    parsed: Option<ParsedUrl>,
}

#[derive(Debug, Serialize)]
struct ParsedUrl {
    full: String,
    protocol: String,
    hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    port: Option<u16>,
    pathname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    search: Option<String>,
}

#[derive(Debug, Serialize)]
struct Socket {
    remote_address: String,
}

#[derive(Debug, Serialize)]
pub(crate) struct RequestSnapshot {
    method: String,
    http_version: String,
    url: UrlSnapshot,
    socket: Socket,
    #[serde(skip_serializing_if = "Option::is_none")]
    headers: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    body: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ResponseSnapshot {
    status_code: u16,
    finished: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    headers: Option<BTreeMap<String, String>>,
}

pub(crate) fn request(
    head: &RequestHead,
    capture_body: bool,
    capture_headers: bool,
    sanitizer: &WildcardSet,
) -> RequestSnapshot {
    let raw = head.uri.to_string();
    let parsed = match parse_url(&head.uri, &head.headers) {
        Ok(parsed) => Some(parsed),
        Err(e) => {
            debug!(uri = %raw, "falling back to raw url: {e}");
            None
        }
    };

    RequestSnapshot {
        method: head.method.to_string(),
        http_version: format!("{:?}", head.version).trim_start_matches("HTTP/").to_owned(),
        url: UrlSnapshot { raw, parsed },
        socket: Socket { remote_address: head.remote_addr.ip().to_string() },
        headers: capture_headers.then(|| headers(&head.headers, sanitizer)),
        body: if capture_body { body(head, sanitizer) } else { None },
    }
}

/// Same as [`request`], already converted for a context bag.
pub(crate) fn request_value(
    head: &RequestHead,
    capture_body: bool,
    capture_headers: bool,
    sanitizer: &WildcardSet,
) -> Value {
    serde_json::to_value(request(head, capture_body, capture_headers, sanitizer))
        .unwrap_or(Value::Null)
}

pub(crate) fn response(
    res: &Response,
    capture_headers: bool,
    sanitizer: &WildcardSet,
) -> ResponseSnapshot {
    ResponseSnapshot {
        status_code: res.status_code().as_u16(),
        finished: true,
        headers: capture_headers.then(|| headers(res.headers(), sanitizer)),
    }
}

fn parse_url(uri: &Uri, headers: &HeaderMap) -> Result<ParsedUrl, SnapshotError> {
    let protocol = uri
        .scheme_str()
        .or_else(|| headers.get(FORWARDED_PROTO).and_then(|v| v.to_str().ok()))
        .unwrap_or("http")
        .to_ascii_lowercase();

    let host = match uri.authority() {
        Some(authority) => authority.as_str().to_owned(),
        None => headers
            .get(HOST)
            .ok_or(SnapshotError::MissingHost)?
            .to_str()
            .map_err(|_| SnapshotError::HostEncoding)?
            .to_owned(),
    };

    let path_and_query = uri.path_and_query().map_or("/", |pq| pq.as_str());
    let full = format!("{protocol}://{host}{path_and_query}");
    let rebuilt: Uri = full
        .parse()
        .map_err(|source| SnapshotError::InvalidUrl { url: full.clone(), source })?;

    Ok(ParsedUrl {
        hostname: rebuilt.host().unwrap_or_default().to_owned(),
        port: rebuilt.port_u16(),
        pathname: rebuilt.path().to_owned(),
        search: rebuilt.query().map(|q| format!("?{q}")),
        protocol: format!("{protocol}:"),
        full,
    })
}

fn headers(map: &HeaderMap, sanitizer: &WildcardSet) -> BTreeMap<String, String> {
    let mut out: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in map {
        let value = if sanitizer.matches(name.as_str()) {
            REDACTED.to_owned()
        } else {
            String::from_utf8_lossy(value.as_bytes()).into_owned()
        };
        out.entry(name.as_str().to_owned())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    out
}

fn body(head: &RequestHead, sanitizer: &WildcardSet) -> Option<String> {
    if head.body.is_empty() {
        return None;
    }
    let text = String::from_utf8_lossy(&head.body);
    let is_form = head
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"));
    if !is_form {
        return Some(text.into_owned());
    }
    let fields: Vec<String> = text
        .split('&')
        .map(|pair| match pair.split_once('=') {
            Some((key, _)) if sanitizer.matches(&decode_form_key(key)) => format!("{key}={REDACTED}"),
            _ => pair.to_owned(),
        })
        .collect();
    Some(fields.join("&"))
}

/// Form keys are percent-encoded with `+` for spaces.
fn decode_form_key(key: &str) -> String {
    let key = key.replace('+', " ");
    match urlencoding::decode(&key) {
        Ok(decoded) => decoded.into_owned(),
        Err(_) => key,
    }
}
