use crate::common::{serve, RequestHandler, TlsConfig};
use crate::config::{Config, ProxyMode};
use crate::domain_proxy::DomainProxy;
use crate::error::ProxyError;
use crate::rewrite::RewriteOptions;
use crate::rewrite_proxy::{RewriteProxy, RewriteProxySettings};
use crate::upstream::HttpUpstream;
use log::{debug, info};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_rustls::TlsAcceptor;

pub trait Proxy {
    fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), ProxyError>> + Send>>;
}

pub struct ProxyFactory;

impl ProxyFactory {
    pub fn create_proxy(config: Config) -> Result<Box<dyn Proxy + Send>, ProxyError> {
        info!("Creating proxy instance for mode: {:?}", config.mode);
        debug!(
            "Proxy configuration - listen_addr: {}, pool_max_idle_per_host: {}",
            config.listen_addr, config.pool_max_idle_per_host
        );

        let tls = match (&config.private_key, &config.certificate) {
            (Some(private_key_path), Some(cert_path)) => {
                info!("Enabling HTTPS/TLS mode");
                debug!("Loading TLS certificate from: {}", cert_path);
                debug!("Loading TLS private key from: {}", private_key_path);
                Some(TlsConfig::acceptor(private_key_path, cert_path)?)
            }
            _ => None,
        };

        let handler: Arc<dyn RequestHandler> = match config.mode {
            ProxyMode::Rewrite => {
                info!("Initializing rewrite proxy mode");
                let upstream = HttpUpstream::new(config.pool_max_idle_per_host)
                    .with_redirects(config.follow_redirects, config.max_redirects);
                let settings = RewriteProxySettings {
                    public_origin: config.public_origin.clone(),
                    tls: tls.is_some(),
                    strict_headers: config.strict_headers,
                    rewrite_options: RewriteOptions {
                        script_calls: config.rewrite_script_calls,
                    },
                    fetch_timeout: config.fetch_timeout_secs.map(Duration::from_secs),
                };
                debug!("Rewrite proxy settings: {:?}", settings);
                Arc::new(RewriteProxy::new(Arc::new(upstream), settings))
            }
            ProxyMode::Domain => {
                info!("Initializing domain proxy mode");
                let backend_url = config.backend_url.as_deref().ok_or_else(|| {
                    ProxyError::Config("Backend URL is required for domain proxy mode".to_string())
                })?;
                info!("Domain proxy backend: {}", backend_url);
                // Backend redirects go back to the browser untouched
                let upstream = HttpUpstream::new(config.pool_max_idle_per_host);
                let proxy = DomainProxy::new(Arc::new(upstream), backend_url)?.with_timeouts(
                    config.lookup_timeout_secs.map(Duration::from_secs),
                    Some(Duration::from_secs(config.fetch_timeout_secs.unwrap_or(30))),
                );
                Arc::new(proxy)
            }
        };

        Ok(Box::new(ServerAdapter {
            handler,
            addr: config.listen_addr,
            tls,
        }))
    }
}

struct ServerAdapter {
    handler: Arc<dyn RequestHandler>,
    addr: SocketAddr,
    tls: Option<TlsAcceptor>,
}

impl Proxy for ServerAdapter {
    fn run(self: Box<Self>) -> Pin<Box<dyn Future<Output = Result<(), ProxyError>> + Send>> {
        Box::pin(async move { serve(self.handler, self.addr, self.tls).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_factory_rewrite() {
        let mut config = Config::default();
        config.listen_addr = "127.0.0.1:8080".parse().unwrap();

        let proxy = ProxyFactory::create_proxy(config);
        assert!(proxy.is_ok());
    }

    #[test]
    fn test_proxy_factory_domain() {
        let mut config = Config::default();
        config.mode = ProxyMode::Domain;
        config.backend_url = Some("https://app.example.com".to_string());

        let proxy = ProxyFactory::create_proxy(config);
        assert!(proxy.is_ok());
    }

    #[test]
    fn test_proxy_factory_domain_no_backend() {
        let mut config = Config::default();
        config.mode = ProxyMode::Domain;
        config.backend_url = None;

        let proxy = ProxyFactory::create_proxy(config);
        assert!(matches!(proxy, Err(ProxyError::Config(_))));
    }

    #[test]
    fn test_proxy_factory_missing_tls_files() {
        let mut config = Config::default();
        config.private_key = Some("/nonexistent/key.pem".to_string());
        config.certificate = Some("/nonexistent/cert.pem".to_string());

        assert!(ProxyFactory::create_proxy(config).is_err());
    }
}
