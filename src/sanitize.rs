use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_SECURITY_POLICY, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS};
use hyper::{HeaderMap, Response, StatusCode};

pub const CORS_HEADERS: [(&str, &str); 5] = [
    ("access-control-allow-origin", "*"),
    ("access-control-allow-methods", "GET, POST, PUT, DELETE, OPTIONS"),
    ("access-control-allow-headers", "*"),
    ("access-control-expose-headers", "*"),
    ("access-control-max-age", "86400"),
];

// Connection-level headers that must not be copied onto a new response
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Overwrites (or adds) the permissive CORS header set.
pub fn apply_cors(headers: &mut HeaderMap) {
    for (name, value) in CORS_HEADERS {
        headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }
}

pub fn cors_headers() -> HeaderMap {
    let mut headers = HeaderMap::with_capacity(CORS_HEADERS.len());
    apply_cors(&mut headers);
    headers
}

pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    for name in HOP_BY_HOP {
        headers.remove(name);
    }
}

/// Removes the headers that stop a page from being framed or read cross-origin.
pub fn strip_embedding_blockers(headers: &mut HeaderMap, strict: bool) {
    headers.remove(X_FRAME_OPTIONS);
    headers.remove(CONTENT_SECURITY_POLICY);
    if strict {
        headers.remove(X_CONTENT_TYPE_OPTIONS);
    }
}

/// Turns upstream response headers into the headers sent back to the client.
///
/// The length is dropped because the body may be rewritten; hyper recomputes it.
pub fn sanitize_headers(upstream: &HeaderMap, strict: bool) -> HeaderMap {
    let mut headers = upstream.clone();
    strip_hop_by_hop(&mut headers);
    headers.remove(CONTENT_LENGTH);
    apply_cors(&mut headers);
    strip_embedding_blockers(&mut headers, strict);
    headers
}

/// Answer to a CORS preflight; never touches the upstream.
pub fn preflight_response() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = StatusCode::NO_CONTENT;
    *response.headers_mut() = cors_headers();
    response
}
