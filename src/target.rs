//! Works out which URL a proxy request is asking for.
//!
//! Two invocation forms are accepted:
//!
//! * `/?url=https%3A%2F%2Fexample.com%2Fpage` (query parameter, preferred)
//! * `/https://example.com/page?x=1` (path-embedded, used when no `url` parameter is present)

use crate::error::ProxyError;
use bytes::Bytes;
use hyper::{HeaderMap, Method, Uri};
use percent_encoding::percent_decode_str;
use url::Url;

pub const TARGET_QUERY_PARAM: &str = "url";

/// A proxy request after its destination has been worked out.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub raw_uri: Uri,
    pub target: Url,
    pub method: Method,
    pub headers: HeaderMap,
    /// `None` for GET and HEAD
    pub body: Option<Bytes>,
}

impl ProxyRequest {
    pub fn new(raw_uri: Uri, method: Method, headers: HeaderMap, body: Bytes) -> Result<Self, ProxyError> {
        let target = resolve_target(&raw_uri)?;
        let body = if method == Method::GET || method == Method::HEAD {
            None
        } else {
            Some(body)
        };

        Ok(Self {
            raw_uri,
            target,
            method,
            headers,
            body,
        })
    }
}

/// Resolves the destination URL of an incoming proxy request.
pub fn resolve_target(uri: &Uri) -> Result<Url, ProxyError> {
    let candidate = query_target(uri)
        .or_else(|| path_target(uri))
        .ok_or(ProxyError::MissingTarget)?;

    let decoded = if candidate.contains('%') {
        percent_decode_str(&candidate)
            .decode_utf8()
            .map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", candidate, e)))?
            .into_owned()
    } else {
        candidate
    };

    let url = Url::parse(&decoded).map_err(|e| ProxyError::InvalidTarget(format!("{}: {}", decoded, e)))?;
    match url.scheme() {
        "http" | "https" => Ok(url),
        scheme => Err(ProxyError::InvalidTarget(format!(
            "unsupported scheme '{}' in {}",
            scheme, decoded
        ))),
    }
}

fn query_target(uri: &Uri) -> Option<String> {
    let query = uri.query()?;
    url::form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == TARGET_QUERY_PARAM)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

fn path_target(uri: &Uri) -> Option<String> {
    let path = uri.path();
    if path.len() <= 1 {
        return None;
    }

    let mut candidate = path[1..].to_string();
    if let Some(query) = uri.query() {
        candidate.push('?');
        candidate.push_str(query);
    }

    Some(repair_scheme(candidate))
}

/// Restores the `//` that path normalisation collapses in `https:/host`.
pub fn repair_scheme(candidate: String) -> String {
    for (collapsed, full) in [("http:/", "http://"), ("https:/", "https://")] {
        if candidate.starts_with(collapsed) && !candidate.starts_with(full) {
            return candidate.replacen(collapsed, full, 1);
        }
    }
    candidate
}
