//! Client-side frame loader.
//!
//! A `FrameLoader` shows third-party pages by fetching them through one of
//! several proxy endpoints and rendering the prepared HTML into its document
//! slot. Endpoints are tried in order until one answers with a success status.

use crate::config::EmbedConfig;
use crate::document::{prepare_document, LOADING_PLACEHOLDER};
use crate::error::ProxyError;
use crate::upstream::{Upstream, UpstreamRequest};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::Method;
use log::{debug, error, info, warn};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use url::Url;

// Characters left alone by JavaScript's encodeURIComponent
const URI_COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

pub fn encode_uri_component(value: &str) -> String {
    utf8_percent_encode(value, URI_COMPONENT).to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Idle,
    Loading,
    Loaded,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LoadRequest {
    pub url: String,
    pub method: Method,
    /// Form-encoded body for non-GET submissions
    pub body: Option<String>,
}

impl LoadRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            method: Method::GET,
            body: None,
        }
    }
}

/// A navigation intercepted inside the framed document.
#[derive(Debug, Clone, PartialEq)]
pub enum Navigation {
    Link {
        href: String,
    },
    Form {
        action: String,
        method: Method,
        fields: Vec<(String, String)>,
    },
}

impl Navigation {
    /// GET forms become a query on the action URL, everything else a form-encoded body.
    pub fn into_request(self) -> LoadRequest {
        match self {
            Navigation::Link { href } => LoadRequest::get(href),
            Navigation::Form { action, method, fields } => {
                let encoded = url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(fields.iter())
                    .finish();

                if method == Method::GET {
                    let action = action.split('#').next().unwrap_or_default().to_string();
                    if encoded.is_empty() {
                        return LoadRequest::get(action);
                    }
                    let separator = if action.contains('?') { '&' } else { '?' };
                    LoadRequest::get(format!("{}{}{}", action, separator, encoded))
                } else {
                    LoadRequest {
                        url: action,
                        method,
                        body: Some(encoded),
                    }
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// Not an http(s) URL; nothing happened
    Ignored,
    /// Rendered from the given endpoint
    Loaded { endpoint: String },
    /// Every endpoint failed; the document keeps its last rendered state
    Failed,
}

pub struct FrameLoader {
    endpoints: Vec<String>,
    upstream: Arc<dyn Upstream>,
    fetch_timeout: Option<Duration>,
    state: RwLock<LoadState>,
    document: RwLock<String>,
}

impl FrameLoader {
    pub fn new(endpoints: Vec<String>, upstream: Arc<dyn Upstream>) -> Self {
        Self {
            endpoints,
            upstream,
            fetch_timeout: None,
            state: RwLock::new(LoadState::Idle),
            document: RwLock::new(String::new()),
        }
    }

    pub fn from_config(config: &EmbedConfig, upstream: Arc<dyn Upstream>) -> Result<Self, ProxyError> {
        if config.endpoints.is_empty() {
            return Err(ProxyError::Config("At least one proxy endpoint is required".to_string()));
        }
        for endpoint in &config.endpoints {
            Url::parse(endpoint)
                .map_err(|e| ProxyError::Config(format!("Invalid proxy endpoint '{}': {}", endpoint, e)))?;
        }

        let mut loader = Self::new(config.endpoints.clone(), upstream);
        loader.fetch_timeout = config.fetch_timeout_secs.map(Duration::from_secs);
        Ok(loader)
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub async fn state(&self) -> LoadState {
        *self.state.read().await
    }

    pub async fn document(&self) -> String {
        self.document.read().await.clone()
    }

    /// Assigns a new source. Non-http values are ignored, unless a load is in flight.
    pub async fn set_source(&self, value: &str) -> Result<LoadOutcome, ProxyError> {
        if value.starts_with("http") {
            return Ok(self.load(value).await);
        }

        if self.state().await == LoadState::Loading {
            return Err(ProxyError::Usage(format!(
                "cannot set source to '{}' while a load is in progress",
                value
            )));
        }
        debug!("Ignoring non-http source '{}'", value);
        Ok(LoadOutcome::Ignored)
    }

    pub async fn load(&self, url: &str) -> LoadOutcome {
        self.load_request(LoadRequest::get(url)).await
    }

    pub async fn navigate(&self, navigation: Navigation) -> LoadOutcome {
        self.load_request(navigation.into_request()).await
    }

    pub async fn load_request(&self, request: LoadRequest) -> LoadOutcome {
        if !request.url.starts_with("http") {
            debug!("Ignoring load of '{}'", request.url);
            return LoadOutcome::Ignored;
        }

        let target = match Url::parse(&request.url) {
            Ok(url) => url,
            Err(e) => {
                error!("Frame load failed for {}: {}", request.url, e);
                *self.state.write().await = LoadState::Failed;
                return LoadOutcome::Failed;
            }
        };

        *self.state.write().await = LoadState::Loading;
        *self.document.write().await = LOADING_PLACEHOLDER.to_string();
        info!("Loading {} {} into frame", request.method, target);

        for endpoint in &self.endpoints {
            match self.fetch_through(endpoint, &request).await {
                Ok(html) => {
                    *self.document.write().await = prepare_document(&html, &target, endpoint);
                    *self.state.write().await = LoadState::Loaded;
                    debug!("Loaded {} through {}", target, endpoint);
                    return LoadOutcome::Loaded {
                        endpoint: endpoint.clone(),
                    };
                }
                Err(e) => warn!("Proxy endpoint {} failed for {}: {}", endpoint, target, e),
            }
        }

        error!("All {} proxy endpoints failed for {}", self.endpoints.len(), target);
        *self.state.write().await = LoadState::Failed;
        LoadOutcome::Failed
    }

    async fn fetch_through(&self, endpoint: &str, request: &LoadRequest) -> Result<String, ProxyError> {
        let url = Url::parse(&format!("{}{}", endpoint, encode_uri_component(&request.url)))?;
        let mut outbound = UpstreamRequest::get(url).with_timeout(self.fetch_timeout);
        outbound.method = request.method.clone();
        if let Some(body) = &request.body {
            outbound.headers.insert(
                CONTENT_TYPE,
                HeaderValue::from_static("application/x-www-form-urlencoded"),
            );
            outbound.body = Some(body.clone().into());
        }

        let response = self.upstream.fetch(outbound).await?;
        if !response.status.is_success() {
            return Err(ProxyError::Upstream(format!("status {}", response.status)));
        }
        Ok(response.text())
    }
}
