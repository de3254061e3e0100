use crate::common::{RequestHandler, ResponseBuilder};
use crate::error::ProxyError;
use crate::rewrite::{is_rewritable, RewriteContext, RewriteOptions, Rewriter};
use crate::sanitize::{preflight_response, sanitize_headers};
use crate::target::ProxyRequest;
use crate::upstream::{Upstream, UpstreamRequest};
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Method, Request, Response};
use log::{debug, error, info};
use std::sync::Arc;
use std::time::Duration;

/// Settings for the `?url=` rewriting proxy.
#[derive(Debug, Clone, Default)]
pub struct RewriteProxySettings {
    /// Fixed proxy origin; `None` derives it from each request's Host header
    pub public_origin: Option<String>,
    /// Scheme assumed when deriving the origin from the Host header
    pub tls: bool,
    pub strict_headers: bool,
    pub rewrite_options: RewriteOptions,
    pub fetch_timeout: Option<Duration>,
}

/// Fetches any URL for the caller, makes it embeddable and loops its links back through itself.
pub struct RewriteProxy {
    upstream: Arc<dyn Upstream>,
    settings: RewriteProxySettings,
}

impl RewriteProxy {
    pub fn new(upstream: Arc<dyn Upstream>, settings: RewriteProxySettings) -> Self {
        Self { upstream, settings }
    }

    fn proxy_origin(&self, req: &Request<Bytes>) -> String {
        if let Some(origin) = &self.settings.public_origin {
            return origin.trim_end_matches('/').to_string();
        }

        let scheme = if self.settings.tls { "https" } else { "http" };
        let host = req
            .headers()
            .get(HOST)
            .and_then(|h| h.to_str().ok())
            .or_else(|| req.uri().authority().map(|a| a.as_str()))
            .unwrap_or("localhost");
        format!("{}://{}", scheme, host)
    }

    async fn process_request(&self, req: Request<Bytes>) -> Result<Response<Full<Bytes>>, ProxyError> {
        let proxy_origin = self.proxy_origin(&req);
        let (parts, body) = req.into_parts();
        let request = ProxyRequest::new(parts.uri, parts.method, parts.headers, body)?;
        info!("{} {} -> {}", request.method, request.raw_uri, request.target);

        let context = RewriteContext::new(&request.target, &proxy_origin)?;
        let outbound = UpstreamRequest::browser(
            request.method.clone(),
            request.target.clone(),
            request.body.clone(),
            request.headers.get(CONTENT_TYPE),
        )
        .with_timeout(self.settings.fetch_timeout);

        let upstream = self.upstream.fetch(outbound).await?;
        debug!("Upstream answered {} ({}) for {}", upstream.status, upstream.content_type(), request.target);

        let headers = sanitize_headers(&upstream.headers, self.settings.strict_headers);
        let body = if is_rewritable(upstream.content_type()) {
            let rewriter = Rewriter::new(context, self.settings.rewrite_options)?;
            Bytes::from(rewriter.rewrite(&upstream.text()))
        } else {
            upstream.body
        };

        let mut response = Response::new(Full::new(body));
        *response.status_mut() = upstream.status;
        *response.headers_mut() = headers;
        Ok(response)
    }
}

#[async_trait]
impl RequestHandler for RewriteProxy {
    async fn handle(&self, req: Request<Bytes>) -> Response<Full<Bytes>> {
        if req.method() == Method::OPTIONS {
            debug!("Answering preflight for {}", req.uri());
            return preflight_response();
        }

        match self.process_request(req).await {
            Ok(response) => response,
            Err(e) => {
                if e.is_client_error() {
                    debug!("Rejected proxy request: {}", e);
                } else {
                    error!("Proxy error: {}", e);
                }
                ResponseBuilder::cors_error(&e)
            }
        }
    }
}
