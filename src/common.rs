use crate::error::ProxyError;
use crate::sanitize::cors_headers;
use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1::Builder as ServerBuilder;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsAcceptor;

/// Common response builder utilities
pub struct ResponseBuilder;

impl ResponseBuilder {
    /// Plain-text response with the given status
    pub fn text(status: StatusCode, message: &str) -> Response<Full<Bytes>> {
        let mut response = Response::new(Full::new(Bytes::from(message.to_string())));
        *response.status_mut() = status;
        response
            .headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
        response
    }

    /// Error response that still carries the CORS header set
    pub fn cors_error(error: &ProxyError) -> Response<Full<Bytes>> {
        let mut response = Self::text(error.status_code(), &error.to_string());
        response.headers_mut().extend(cors_headers());
        response
    }

    pub fn internal_server_error() -> Response<Full<Bytes>> {
        Self::text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
    }

    pub fn not_found(message: &str) -> Response<Full<Bytes>> {
        Self::text(StatusCode::NOT_FOUND, message)
    }
}

/// Loads the PEM certificate chain and key used when serving HTTPS.
pub struct TlsConfig;

impl TlsConfig {
    pub fn acceptor(private_key_path: &str, cert_path: &str) -> Result<TlsAcceptor, ProxyError> {
        let certs = load_certs(cert_path)?;
        let key = load_key(private_key_path)?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| ProxyError::Config(format!("{} does not match {}: {}", private_key_path, cert_path, e)))?;
        // connections are served with http1 only
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

fn pem_file(path: &str) -> Result<BufReader<File>, ProxyError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| ProxyError::Config(format!("cannot open {}: {}", path, e)))
}

fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>, ProxyError> {
    let certs = rustls_pemfile::certs(&mut pem_file(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Config(format!("bad certificate in {}: {}", path, e)))?;
    if certs.is_empty() {
        return Err(ProxyError::Config(format!("no certificate in {}", path)));
    }
    Ok(certs)
}

fn load_key(path: &str) -> Result<PrivateKeyDer<'static>, ProxyError> {
    rustls_pemfile::private_key(&mut pem_file(path)?)
        .map_err(|e| ProxyError::Config(format!("bad private key in {}: {}", path, e)))?
        .ok_or_else(|| ProxyError::Config(format!("no private key in {}", path)))
}

/// A proxy's request pipeline, fed with fully buffered requests.
///
/// Implementations must turn every failure into a response; there is no error path.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, req: Request<Bytes>) -> Response<Full<Bytes>>;
}

async fn buffer_request(req: Request<Incoming>) -> Result<Request<Bytes>, ProxyError> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    Ok(Request::from_parts(parts, body))
}

async fn serve_connection<S>(stream: S, remote_addr: SocketAddr, handler: Arc<dyn RequestHandler>)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let handler = handler.clone();
        async move {
            let response = match buffer_request(req).await {
                Ok(req) => handler.handle(req).await,
                Err(e) => {
                    log::warn!("Failed to read request body from {}: {}", remote_addr, e);
                    ResponseBuilder::cors_error(&e)
                }
            };
            Ok::<_, Infallible>(response)
        }
    });

    if let Err(err) = ServerBuilder::new()
        .keep_alive(true)
        .serve_connection(TokioIo::new(stream), service)
        .await
    {
        log::debug!("Connection from {} closed with error: {}", remote_addr, err);
    }
}

/// Accept loop shared by every proxy mode. Each connection runs in its own task.
pub async fn serve(
    handler: Arc<dyn RequestHandler>,
    addr: SocketAddr,
    tls: Option<TlsAcceptor>,
) -> Result<(), ProxyError> {
    log::info!("Binding TCP listener to: {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let scheme = if tls.is_some() { "https" } else { "http" };
    log::info!("Listening on: {}://{}", scheme, addr);

    loop {
        let (stream, remote_addr) = listener.accept().await?;
        let handler = handler.clone();
        let tls = tls.clone();

        tokio::spawn(async move {
            match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => serve_connection(tls_stream, remote_addr, handler).await,
                    Err(e) => log::warn!("TLS handshake failed from {}: {}", remote_addr, e),
                },
                None => serve_connection(stream, remote_addr, handler).await,
            }
        });
    }
}
