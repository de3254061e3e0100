use crate::common::{RequestHandler, ResponseBuilder};
use crate::error::ProxyError;
use crate::sanitize::strip_hop_by_hop;
use crate::upstream::{Upstream, UpstreamRequest};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{
    HeaderName, HeaderValue, ACCESS_CONTROL_ALLOW_ORIGIN, CONTENT_LENGTH, CONTENT_SECURITY_POLICY, HOST,
    USER_AGENT, X_FRAME_OPTIONS,
};
use hyper::{Method, Request, Response, StatusCode};
use log::{debug, error, info, warn};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use url::{Host, Url};

pub const LOOKUP_USER_AGENT: &str = "framebridge-domain-proxy/1.0";
pub const DOMAIN_NOT_CONFIGURED: &str = "Domain not configured";

static X_CUSTOM_DOMAIN: HeaderName = HeaderName::from_static("x-custom-domain");
static X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
static X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");
static X_POWERED_BY: HeaderName = HeaderName::from_static("x-powered-by");

#[derive(Debug, Deserialize)]
struct DomainLookup {
    #[serde(rename = "appId")]
    app_id: serde_json::Value,
}

impl DomainLookup {
    fn app_id(&self) -> Option<String> {
        match &self.app_id {
            serde_json::Value::String(s) if !s.is_empty() => Some(s.clone()),
            serde_json::Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }
}

/// Serves custom hostnames by mapping each one to an application on the backend.
pub struct DomainProxy {
    upstream: Arc<dyn Upstream>,
    backend: Url,
    lookup_timeout: Option<Duration>,
    fetch_timeout: Option<Duration>,
}

impl DomainProxy {
    pub fn new(upstream: Arc<dyn Upstream>, backend_url: &str) -> Result<Self, ProxyError> {
        Ok(Self {
            upstream,
            backend: Url::parse(backend_url)?,
            lookup_timeout: Some(Duration::from_secs(5)),
            fetch_timeout: Some(Duration::from_secs(30)),
        })
    }

    pub fn with_timeouts(mut self, lookup: Option<Duration>, fetch: Option<Duration>) -> Self {
        self.lookup_timeout = lookup;
        self.fetch_timeout = fetch;
        self
    }

    fn backend_base(&self) -> &str {
        self.backend.as_str().trim_end_matches('/')
    }

    /// Asks the backend which application a hostname belongs to.
    pub async fn lookup_app(&self, hostname: &str) -> Result<String, ProxyError> {
        let hostname = &parse_hostname(hostname)?;
        let url = Url::parse(&format!("{}/api/domains/{}", self.backend_base(), hostname))?;
        let mut request = UpstreamRequest::get(url).with_timeout(self.lookup_timeout);
        request
            .headers
            .insert(USER_AGENT, HeaderValue::from_static(LOOKUP_USER_AGENT));

        let response = self.upstream.fetch(request).await?;
        if !response.status.is_success() {
            debug!("Lookup for {} answered {}", hostname, response.status);
            return Err(ProxyError::NotFound(DOMAIN_NOT_CONFIGURED.to_string()));
        }

        let lookup: DomainLookup = serde_json::from_slice(&response.body)
            .map_err(|e| ProxyError::Upstream(format!("bad lookup response for {}: {}", hostname, e)))?;
        lookup
            .app_id()
            .ok_or_else(|| ProxyError::Upstream(format!("lookup for {} returned no appId", hostname)))
    }

    fn app_url(&self, app_id: &str, req: &Request<Bytes>) -> Result<Url, ProxyError> {
        let mut target = format!("{}/app/{}{}", self.backend_base(), app_id, req.uri().path());
        if let Some(query) = req.uri().query() {
            target.push('?');
            target.push_str(query);
        }
        Ok(Url::parse(&target)?)
    }

    async fn process_request(&self, req: Request<Bytes>) -> Result<Response<Full<Bytes>>, ProxyError> {
        let hostname = request_hostname(&req)
            .ok_or_else(|| ProxyError::InvalidTarget("request has no Host header".to_string()))?;
        let hostname = parse_hostname(&hostname)?;

        let app_id = self.lookup_app(&hostname).await?;
        let target = self.app_url(&app_id, &req)?;
        info!("{} {}{} -> {}", req.method(), hostname, req.uri(), target);

        let (parts, body) = req.into_parts();
        let mut headers = parts.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(HOST);
        headers.remove(CONTENT_LENGTH);

        let host_value = HeaderValue::from_str(&hostname)
            .map_err(|e| ProxyError::Http(format!("invalid hostname header: {}", e)))?;
        headers.insert(X_CUSTOM_DOMAIN.clone(), host_value.clone());
        headers.insert(X_FORWARDED_HOST.clone(), host_value);
        headers.insert(X_FORWARDED_PROTO.clone(), HeaderValue::from_static("https"));

        let body = match parts.method {
            Method::GET | Method::HEAD => None,
            _ => Some(body),
        };

        let request = UpstreamRequest {
            method: parts.method,
            url: target,
            headers,
            body,
            timeout: self.fetch_timeout,
        };
        let upstream = self.upstream.fetch(request).await?;

        let mut headers = upstream.headers;
        strip_hop_by_hop(&mut headers);
        headers.remove(CONTENT_LENGTH);
        headers.remove(X_FRAME_OPTIONS);
        headers.remove(CONTENT_SECURITY_POLICY);
        headers.insert(X_POWERED_BY.clone(), HeaderValue::from_static("framebridge"));
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));

        let mut response = Response::new(Full::new(upstream.body));
        *response.status_mut() = upstream.status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

/// Hostname of the inbound request, port removed.
fn request_hostname(req: &Request<Bytes>) -> Option<String> {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?;

    let hostname = match host.strip_prefix('[') {
        // IPv6 literal
        Some(rest) => rest.split(']').next().unwrap_or(rest),
        None => host.split(':').next().unwrap_or(host),
    };
    (!hostname.is_empty()).then(|| hostname.to_ascii_lowercase())
}

/// Checks that a hostname is a plain domain or IP address and normalizes it.
///
/// The result is pasted into the lookup path, so anything that could change
/// the path (separators, escapes, dot segments, userinfo) is rejected.
fn parse_hostname(raw: &str) -> Result<String, ProxyError> {
    let invalid = |reason: &str| ProxyError::InvalidTarget(format!("invalid Host header {:?}: {}", raw, reason));

    if raw.contains(['/', '\\', '?', '#', '%', '@']) {
        return Err(invalid("forbidden character"));
    }
    let host = if raw.contains(':') {
        Host::parse(&format!("[{}]", raw))
    } else {
        Host::parse(raw)
    }
    .map_err(|e| invalid(&e.to_string()))?;

    match host {
        Host::Domain(domain) => {
            if domain.strip_suffix('.').unwrap_or(&domain).split('.').any(str::is_empty) {
                return Err(invalid("empty label"));
            }
            Ok(domain)
        }
        Host::Ipv4(addr) => Ok(addr.to_string()),
        Host::Ipv6(addr) => Ok(addr.to_string()),
    }
}

#[async_trait]
impl RequestHandler for DomainProxy {
    async fn handle(&self, req: Request<Bytes>) -> Response<Full<Bytes>> {
        match self.process_request(req).await {
            Ok(response) => response,
            Err(ProxyError::NotFound(message)) => {
                warn!("{}", message);
                ResponseBuilder::not_found(&message)
            }
            Err(e @ ProxyError::InvalidTarget(_)) => {
                warn!("Rejected domain request: {}", e);
                ResponseBuilder::text(StatusCode::BAD_REQUEST, &e.to_string())
            }
            Err(e) => {
                error!("Domain proxy error: {}", e);
                ResponseBuilder::internal_server_error()
            }
        }
    }
}
