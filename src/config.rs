use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use url::Url;

use crate::error::ProxyError;

pub const ENV_LISTEN_ADDR: &str = "FRAMEBRIDGE_LISTEN_ADDR";
pub const ENV_PUBLIC_ORIGIN: &str = "FRAMEBRIDGE_PUBLIC_ORIGIN";
pub const ENV_BACKEND_URL: &str = "FRAMEBRIDGE_BACKEND_URL";
pub const ENV_PROXY_ENDPOINTS: &str = "FRAMEBRIDGE_PROXY_ENDPOINTS";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Trace => log::LevelFilter::Trace,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error => log::LevelFilter::Error,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    pub path: Option<PathBuf>,
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<LogLevel>,
    pub format: Option<LogFormat>,
    pub targets: Option<Vec<LogTarget>>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Some(LogLevel::Info),
            format: Some(LogFormat::Text),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProxyMode {
    /// `?url=` rewriting proxy with CORS and header stripping
    Rewrite,
    /// Custom-hostname proxy in front of the application backend
    Domain,
}

/// Settings for the client-side frame loader.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbedConfig {
    /// Proxy invocation prefixes, tried in order (e.g. `https://proxy.example.com?url=`)
    #[serde(default)]
    pub endpoints: Vec<String>,
    /// Per-endpoint fetch timeout in seconds
    #[serde(default)]
    pub fetch_timeout_secs: Option<u64>,
}

fn default_true() -> bool {
    true
}

fn default_max_redirects() -> usize {
    10
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_lookup_timeout() -> Option<u64> {
    Some(5)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mode: ProxyMode,
    pub listen_addr: SocketAddr,
    // Origin used when rewriting URLs back through the proxy.
    // Falls back to the Host header of each request.
    #[serde(default)]
    pub public_origin: Option<String>,
    // Application backend for domain mode
    #[serde(default)]
    pub backend_url: Option<String>,
    // Also strip X-Content-Type-Options
    #[serde(default = "default_true")]
    pub strict_headers: bool,
    #[serde(default)]
    pub rewrite_script_calls: bool,
    #[serde(default = "default_true")]
    pub follow_redirects: bool,
    #[serde(default = "default_max_redirects")]
    pub max_redirects: usize,
    // None = no timeout
    #[serde(default)]
    pub fetch_timeout_secs: Option<u64>,
    #[serde(default = "default_lookup_timeout")]
    pub lookup_timeout_secs: Option<u64>,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub embed: Option<EmbedConfig>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: ProxyMode::Rewrite,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            public_origin: None,
            backend_url: None,
            strict_headers: true,
            rewrite_script_calls: false,
            follow_redirects: true,
            max_redirects: default_max_redirects(),
            fetch_timeout_secs: None,
            lookup_timeout_secs: default_lookup_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            private_key: None,
            certificate: None,
            embed: None,
            logging: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Applies `FRAMEBRIDGE_*` overrides from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ProxyError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Applies overrides from an arbitrary lookup, so tests don't touch the real environment.
    pub fn apply_env_from<F>(&mut self, lookup: F) -> Result<(), ProxyError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup(ENV_LISTEN_ADDR) {
            self.listen_addr = addr
                .parse()
                .map_err(|e| ProxyError::Config(format!("{} is not a socket address: {}", ENV_LISTEN_ADDR, e)))?;
        }
        if let Some(origin) = lookup(ENV_PUBLIC_ORIGIN) {
            self.public_origin = Some(origin);
        }
        if let Some(backend) = lookup(ENV_BACKEND_URL) {
            self.backend_url = Some(backend);
        }
        if let Some(endpoints) = lookup(ENV_PROXY_ENDPOINTS) {
            let endpoints: Vec<String> = endpoints
                .split(',')
                .map(str::trim)
                .filter(|e| !e.is_empty())
                .map(str::to_string)
                .collect();
            self.embed.get_or_insert_with(EmbedConfig::default).endpoints = endpoints;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ProxyError> {
        if let Some(origin) = &self.public_origin {
            let url = Url::parse(origin)
                .map_err(|e| ProxyError::Config(format!("Invalid public_origin '{}': {}", origin, e)))?;
            if url.scheme() != "http" && url.scheme() != "https" {
                return Err(ProxyError::Config(format!("public_origin must be http or https: {}", origin)));
            }
        }

        match self.mode {
            ProxyMode::Domain => {
                let backend = self.backend_url.as_deref().ok_or_else(|| {
                    ProxyError::Config("Domain mode requires backend_url".to_string())
                })?;
                Url::parse(backend)
                    .map_err(|e| ProxyError::Config(format!("Invalid backend_url '{}': {}", backend, e)))?;
            }
            ProxyMode::Rewrite => {
                if self.follow_redirects && self.max_redirects == 0 {
                    return Err(ProxyError::Config(
                        "max_redirects must be greater than 0 when follow_redirects is enabled".to_string(),
                    ));
                }
            }
        }

        match (&self.private_key, &self.certificate) {
            (Some(_), None) | (None, Some(_)) => Err(ProxyError::Config(
                "Both TLS certificate and key must be provided together".to_string(),
            )),
            _ => Ok(()),
        }
    }
}
