//! Tests for the pooled HTTP fetcher against a local origin server

use bytes::Bytes;
use framebridge::common::RequestHandler;
use framebridge::error::ProxyError;
use framebridge::rewrite_proxy::{RewriteProxy, RewriteProxySettings};
use framebridge::sanitize::CORS_HEADERS;
use framebridge::upstream::{HttpUpstream, Upstream, UpstreamRequest};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE, LOCATION};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use url::Url;

/// Requests the origin received, as `METHOD path content-type body`
type Log = Arc<Mutex<Vec<String>>>;

fn redirect(status: StatusCode, location: &str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(LOCATION, HeaderValue::from_str(location).unwrap());
    response
}

async fn route(req: Request<Incoming>, log: Log) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let content_type = req
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let body = req.into_body().collect().await.unwrap().to_bytes();
    let body = String::from_utf8_lossy(&body).into_owned();
    log.lock()
        .unwrap()
        .push(format!("{} {} {} {}", method, path, content_type, body).trim_end().to_string());

    let response = match path.as_str() {
        "/loop" => redirect(StatusCode::FOUND, "/loop"),
        "/see-other" => redirect(StatusCode::SEE_OTHER, "/landing"),
        "/found" => redirect(StatusCode::FOUND, "/landing"),
        "/moved" => redirect(StatusCode::MOVED_PERMANENTLY, "/landing"),
        "/temporary" => redirect(StatusCode::TEMPORARY_REDIRECT, "/landing"),
        "/docs/guide/start" => redirect(StatusCode::FOUND, "../landing"),
        "/slow" => {
            tokio::time::sleep(Duration::from_secs(3)).await;
            Response::new(Full::new(Bytes::from_static(b"late")))
        }
        _ => Response::new(Full::new(Bytes::from(format!("{} {}", method, path)))),
    };
    Ok(response)
}

/// Starts an origin on an ephemeral port and returns its address plus the request log.
async fn origin() -> (SocketAddr, Log) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let log: Log = Arc::new(Mutex::new(Vec::new()));

    let server_log = log.clone();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let log = server_log.clone();
            tokio::spawn(async move {
                let service = service_fn(move |req| route(req, log.clone()));
                let _ = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    (addr, log)
}

fn url(addr: SocketAddr, path: &str) -> Url {
    Url::parse(&format!("http://{}{}", addr, path)).unwrap()
}

fn post(url: Url) -> UpstreamRequest {
    let mut request = UpstreamRequest::get(url);
    request.method = Method::POST;
    request
        .headers
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/x-www-form-urlencoded"));
    request.body = Some(Bytes::from_static(b"q=1"));
    request
}

#[tokio::test]
async fn test_redirect_loop_hits_limit() {
    let (addr, log) = origin().await;
    let upstream = HttpUpstream::new(4).with_redirects(true, 3);

    let result = upstream.fetch(UpstreamRequest::get(url(addr, "/loop"))).await;

    match result {
        Err(ProxyError::Upstream(message)) => assert!(message.contains("too many redirects (limit 3)"), "{}", message),
        other => panic!("expected redirect limit error, got {:?}", other),
    }
    // first request plus three followed hops
    assert_eq!(log.lock().unwrap().len(), 4);
}

#[tokio::test]
async fn test_redirects_returned_when_not_following() {
    let (addr, log) = origin().await;
    let upstream = HttpUpstream::new(4);

    let response = upstream.fetch(UpstreamRequest::get(url(addr, "/found"))).await.unwrap();

    assert_eq!(response.status, StatusCode::FOUND);
    assert_eq!(response.headers.get(LOCATION).unwrap(), "/landing");
    assert_eq!(log.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_see_other_becomes_get_without_body() {
    let (addr, log) = origin().await;
    let upstream = HttpUpstream::new(4).with_redirects(true, 5);

    let response = upstream.fetch(post(url(addr, "/see-other"))).await.unwrap();

    assert_eq!(response.status, StatusCode::OK);
    assert_eq!(response.text(), "GET /landing");
    assert_eq!(response.url, url(addr, "/landing"));
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "POST /see-other application/x-www-form-urlencoded q=1".to_string(),
            "GET /landing -".to_string(),
        ]
    );
}

#[tokio::test]
async fn test_found_and_moved_downgrade_post() {
    let (addr, log) = origin().await;
    let upstream = HttpUpstream::new(4).with_redirects(true, 5);

    for path in ["/found", "/moved"] {
        let response = upstream.fetch(post(url(addr, path))).await.unwrap();
        assert_eq!(response.text(), "GET /landing", "after {}", path);
    }
    assert_eq!(log.lock().unwrap().last().unwrap(), "GET /landing -");
}

#[tokio::test]
async fn test_temporary_redirect_keeps_method_and_body() {
    let (addr, log) = origin().await;
    let upstream = HttpUpstream::new(4).with_redirects(true, 5);

    let response = upstream.fetch(post(url(addr, "/temporary"))).await.unwrap();

    assert_eq!(response.text(), "POST /landing");
    assert_eq!(
        log.lock().unwrap().last().unwrap(),
        "POST /landing application/x-www-form-urlencoded q=1"
    );
}

#[tokio::test]
async fn test_relative_location_resolves_against_current_url() {
    let (addr, log) = origin().await;
    let upstream = HttpUpstream::new(4).with_redirects(true, 5);

    let response = upstream
        .fetch(UpstreamRequest::get(url(addr, "/docs/guide/start")))
        .await
        .unwrap();

    assert_eq!(response.url, url(addr, "/docs/landing"));
    assert_eq!(response.text(), "GET /docs/landing");
    assert_eq!(log.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_slow_origin_times_out() {
    let (addr, _log) = origin().await;
    let upstream = HttpUpstream::new(4);

    let request = UpstreamRequest::get(url(addr, "/slow")).with_timeout(Some(Duration::from_secs(1)));
    let result = upstream.fetch(request).await;

    assert!(matches!(result, Err(ProxyError::Timeout(1))), "got {:?}", result);
}

#[tokio::test]
async fn test_timeout_through_rewrite_proxy_is_500_with_cors() {
    let (addr, _log) = origin().await;
    let upstream = Arc::new(HttpUpstream::new(4).with_redirects(true, 5));
    let proxy = RewriteProxy::new(
        upstream,
        RewriteProxySettings {
            public_origin: Some("https://proxy.example.net".to_string()),
            strict_headers: true,
            fetch_timeout: Some(Duration::from_secs(1)),
            ..Default::default()
        },
    );

    let target = format!("http%3A%2F%2F{}%2Fslow", addr);
    let request = Request::builder()
        .uri(format!("/?url={}", target))
        .header("host", "proxy.example.net")
        .body(Bytes::new())
        .unwrap();
    let response = proxy.handle(request).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    for (name, value) in CORS_HEADERS {
        assert_eq!(response.headers().get(name).unwrap(), value, "missing CORS header {}", name);
    }
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"Upstream request timed out after 1 seconds");
}
