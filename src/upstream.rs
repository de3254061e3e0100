//! Outbound side of the proxy: one request to the origin, one buffered response back.

use crate::error::ProxyError;
use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::{GzDecoder, ZlibDecoder};
use http_body_util::{BodyExt, Full};
use hyper::header::{
    ACCEPT, ACCEPT_LANGUAGE, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, USER_AGENT,
};
use hyper::{HeaderMap, Method, Request, StatusCode};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use log::{debug, warn};
use std::io::Read;
use std::time::Duration;
use tokio::time::timeout;
use url::Url;

pub const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
pub const BROWSER_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8";
pub const BROWSER_ACCEPT_LANGUAGE: &str = "en-US,en;q=0.5";

#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Option<Bytes>,
    /// Applies to this call only; `None` waits indefinitely
    pub timeout: Option<Duration>,
}

impl UpstreamRequest {
    pub fn get(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// Request carrying the fixed browser-like header set instead of the caller's headers.
    pub fn browser(method: Method, url: Url, body: Option<Bytes>, content_type: Option<&hyper::header::HeaderValue>) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, hyper::header::HeaderValue::from_static(BROWSER_USER_AGENT));
        headers.insert(ACCEPT, hyper::header::HeaderValue::from_static(BROWSER_ACCEPT));
        headers.insert(ACCEPT_LANGUAGE, hyper::header::HeaderValue::from_static(BROWSER_ACCEPT_LANGUAGE));
        if let (Some(_), Some(content_type)) = (&body, content_type) {
            headers.insert(CONTENT_TYPE, content_type.clone());
        }

        Self {
            method,
            url,
            headers,
            body,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }
}

#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// URL the body was finally served from, after redirects
    pub url: Url,
}

impl UpstreamResponse {
    pub fn content_type(&self) -> &str {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Anything able to perform an outbound HTTP exchange.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ProxyError>;
}

/// hyper-based fetcher with pooled HTTP/HTTPS connections.
pub struct HttpUpstream {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    follow_redirects: bool,
    max_redirects: usize,
}

impl HttpUpstream {
    pub fn new(pool_max_idle_per_host: usize) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(90))
            .build(HttpsConnector::new());

        Self {
            client,
            follow_redirects: false,
            max_redirects: 0,
        }
    }

    pub fn with_redirects(mut self, follow: bool, max_redirects: usize) -> Self {
        self.follow_redirects = follow;
        self.max_redirects = max_redirects;
        self
    }

    async fn send_once(&self, request: &UpstreamRequest) -> Result<UpstreamResponse, ProxyError> {
        let mut builder = Request::builder()
            .method(request.method.clone())
            .uri(request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        let outbound = builder.body(Full::new(request.body.clone().unwrap_or_default()))?;

        let exchange = async {
            let response = self
                .client
                .request(outbound)
                .await
                .map_err(|e| ProxyError::Upstream(format!("{}: {}", request.url, e)))?;
            let (parts, body) = response.into_parts();
            let body = body.collect().await?.to_bytes();
            Ok::<_, ProxyError>((parts, body))
        };

        let (parts, body) = match request.timeout {
            Some(limit) => timeout(limit, exchange)
                .await
                .map_err(|_| ProxyError::Timeout(limit.as_secs()))??,
            None => exchange.await?,
        };

        let mut headers = parts.headers;
        let body = decode_body(&mut headers, body);

        Ok(UpstreamResponse {
            status: parts.status,
            headers,
            body,
            url: request.url.clone(),
        })
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ProxyError> {
        let mut request = request;
        let mut hops = 0;

        loop {
            debug!("Fetching upstream {} {}", request.method, request.url);
            let response = self.send_once(&request).await?;

            if !self.follow_redirects || !response.status.is_redirection() {
                return Ok(response);
            }
            let Some(next) = redirect_target(&response) else {
                return Ok(response);
            };

            hops += 1;
            if hops > self.max_redirects {
                warn!("Too many redirects fetching {}", request.url);
                return Err(ProxyError::Upstream(format!(
                    "too many redirects (limit {}) for {}",
                    self.max_redirects, request.url
                )));
            }

            debug!("Following {} redirect to {}", response.status, next);
            // 303 always becomes GET; 301/302 downgrade POST the way browsers do
            let downgrade = response.status == StatusCode::SEE_OTHER
                || (matches!(response.status, StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND)
                    && request.method == Method::POST);
            if downgrade {
                request.method = Method::GET;
                request.body = None;
                request.headers.remove(CONTENT_TYPE);
            }
            request.url = next;
        }
    }
}

fn redirect_target(response: &UpstreamResponse) -> Option<Url> {
    let location = response.headers.get(LOCATION)?.to_str().ok()?;
    response.url.join(location).ok()
}

/// Undoes gzip/deflate transfer compression, the way a browser fetch would.
fn decode_body(headers: &mut HeaderMap, body: Bytes) -> Bytes {
    let encoding = headers
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_ascii_lowercase());

    let decoded = match encoding.as_deref() {
        Some("gzip") | Some("x-gzip") => {
            let mut out = Vec::new();
            GzDecoder::new(&body[..]).read_to_end(&mut out).map(|_| out)
        }
        Some("deflate") => {
            let mut out = Vec::new();
            ZlibDecoder::new(&body[..]).read_to_end(&mut out).map(|_| out)
        }
        _ => return body,
    };

    match decoded {
        Ok(out) => {
            headers.remove(CONTENT_ENCODING);
            headers.remove(CONTENT_LENGTH);
            Bytes::from(out)
        }
        Err(e) => {
            warn!("Could not decode {:?} body, passing it through: {}", encoding, e);
            body
        }
    }
}
