//! Integration tests for the custom-hostname proxy

use async_trait::async_trait;
use bytes::Bytes;
use framebridge::common::RequestHandler;
use framebridge::domain_proxy::{DomainProxy, LOOKUP_USER_AGENT};
use framebridge::error::ProxyError;
use framebridge::upstream::{Upstream, UpstreamRequest, UpstreamResponse};
use http_body_util::BodyExt;
use hyper::header::{HeaderValue, USER_AGENT};
use hyper::{HeaderMap, Method, Request, StatusCode};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Fake backend: one mapped hostname, one application
#[derive(Default)]
struct FakeBackend {
    seen: Mutex<Vec<UpstreamRequest>>,
    app_unreachable: bool,
}

#[async_trait]
impl Upstream for FakeBackend {
    async fn fetch(&self, request: UpstreamRequest) -> Result<UpstreamResponse, ProxyError> {
        self.seen.lock().unwrap().push(request.clone());
        let path = request.url.path().to_string();
        let mut headers = HeaderMap::new();

        let (status, body) = if path == "/api/domains/shop.example.com" {
            headers.insert("content-type", HeaderValue::from_static("application/json"));
            (StatusCode::OK, Bytes::from_static(br#"{"appId":"app42","plan":"pro"}"#))
        } else if path.starts_with("/api/domains/") {
            (StatusCode::NOT_FOUND, Bytes::from_static(b"{}"))
        } else if path.starts_with("/app/app42") {
            if self.app_unreachable {
                return Err(ProxyError::Upstream("connection reset".to_string()));
            }
            headers.insert("content-type", HeaderValue::from_static("text/html"));
            headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
            headers.insert("content-security-policy", HeaderValue::from_static("default-src 'self'"));
            headers.insert("set-cookie", HeaderValue::from_static("sid=1"));
            (StatusCode::OK, Bytes::from_static(b"<h1>shop</h1>"))
        } else {
            (StatusCode::NOT_FOUND, Bytes::new())
        };

        Ok(UpstreamResponse {
            status,
            headers,
            body,
            url: request.url,
        })
    }
}

fn proxy(backend: Arc<FakeBackend>) -> DomainProxy {
    DomainProxy::new(backend, "https://backend.example.com/")
        .unwrap()
        .with_timeouts(Some(Duration::from_secs(5)), Some(Duration::from_secs(30)))
}

fn request(host: &str, method: Method, uri: &str, body: &'static [u8]) -> Request<Bytes> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("host", host)
        .header("accept-language", "pt-BR")
        .header("connection", "keep-alive")
        .body(Bytes::from_static(body))
        .unwrap()
}

#[tokio::test]
async fn test_mapped_domain_is_served_from_app() {
    let backend = Arc::new(FakeBackend::default());
    let proxy = proxy(backend.clone());

    let response = proxy
        .handle(request("shop.example.com:443", Method::GET, "/products?page=2", b""))
        .await;

    assert_eq!(response.status(), StatusCode::OK);
    let headers = response.headers().clone();
    assert!(headers.get("x-frame-options").is_none());
    assert!(headers.get("content-security-policy").is_none());
    assert_eq!(headers.get("x-powered-by").unwrap(), "framebridge");
    assert_eq!(headers.get("access-control-allow-origin").unwrap(), "*");
    assert_eq!(headers.get("set-cookie").unwrap(), "sid=1");
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"<h1>shop</h1>");

    let seen = backend.seen.lock().unwrap();
    assert_eq!(seen.len(), 2);

    let lookup = &seen[0];
    assert_eq!(lookup.url.as_str(), "https://backend.example.com/api/domains/shop.example.com");
    assert_eq!(lookup.headers.get(USER_AGENT).unwrap(), LOOKUP_USER_AGENT);
    assert_eq!(lookup.timeout, Some(Duration::from_secs(5)));

    let forwarded = &seen[1];
    assert_eq!(
        forwarded.url.as_str(),
        "https://backend.example.com/app/app42/products?page=2"
    );
    assert_eq!(forwarded.headers.get("x-custom-domain").unwrap(), "shop.example.com");
    assert_eq!(forwarded.headers.get("x-forwarded-host").unwrap(), "shop.example.com");
    assert_eq!(forwarded.headers.get("x-forwarded-proto").unwrap(), "https");
    assert_eq!(forwarded.headers.get("accept-language").unwrap(), "pt-BR");
    assert!(forwarded.headers.get("connection").is_none());
    assert!(forwarded.headers.get("host").is_none());
    assert_eq!(forwarded.timeout, Some(Duration::from_secs(30)));
}

#[tokio::test]
async fn test_unmapped_domain_is_404() {
    let backend = Arc::new(FakeBackend::default());
    let proxy = proxy(backend.clone());

    let response = proxy
        .handle(request("unknown.example.org", Method::GET, "/", b""))
        .await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"Domain not configured");
    assert_eq!(backend.seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_post_body_is_forwarded() {
    let backend = Arc::new(FakeBackend::default());
    let proxy = proxy(backend.clone());

    proxy
        .handle(request("shop.example.com", Method::POST, "/cart", b"item=7"))
        .await;

    let seen = backend.seen.lock().unwrap();
    let forwarded = &seen[1];
    assert_eq!(forwarded.method, Method::POST);
    assert_eq!(forwarded.body.as_deref(), Some(&b"item=7"[..]));
}

#[tokio::test]
async fn test_app_failure_is_generic_500() {
    let backend = Arc::new(FakeBackend {
        app_unreachable: true,
        ..Default::default()
    });
    let proxy = proxy(backend);

    let response = proxy
        .handle(request("shop.example.com", Method::GET, "/", b""))
        .await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"Internal Server Error");
}

#[tokio::test]
async fn test_host_with_path_characters_is_rejected() {
    let backend = Arc::new(FakeBackend::default());
    let proxy = proxy(backend.clone());

    let response = proxy
        .handle(request("x/../../internal/secret?", Method::GET, "/", b""))
        .await;

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(backend.seen.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_lookup_rejects_hostname_outside_domain_path() {
    let backend = Arc::new(FakeBackend::default());
    let proxy = proxy(backend.clone());

    let result = proxy.lookup_app("..").await;

    assert!(matches!(result, Err(ProxyError::InvalidTarget(_))));
    assert!(backend.seen.lock().unwrap().is_empty());
}
