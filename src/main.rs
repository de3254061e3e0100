use anyhow::{bail, Context};
use clap::Parser;
use framebridge::config::{Config, EmbedConfig, LoggingConfig, ProxyMode};
use framebridge::embed::{FrameLoader, LoadOutcome};
use framebridge::logging::{init_fallback, parse_log_format, parse_log_level, CustomLogger};
use framebridge::proxy::ProxyFactory;
use framebridge::upstream::HttpUpstream;
use log::{debug, error, info};
use std::path::Path;
use std::sync::Arc;
use tokio::signal;

#[derive(Parser)]
#[clap(
    version,
    about = "Rewriting HTTP proxy that makes third-party pages embeddable in frames"
)]
struct Args {
    #[clap(short, long, value_name = "MODE", help = "Proxy mode: rewrite or domain")]
    mode: Option<String>,

    #[clap(short, long, value_name = "ADDR", help = "Listen address (e.g., 127.0.0.1:8080)")]
    listen: Option<String>,

    #[clap(short, long, value_name = "FILE", help = "Configuration file path")]
    config: Option<String>,

    #[clap(long, value_name = "URL", help = "Public origin of this proxy, used in rewritten URLs")]
    public_origin: Option<String>,

    #[clap(long, value_name = "URL", help = "Application backend for domain mode")]
    backend_url: Option<String>,

    #[clap(long, help = "Keep X-Content-Type-Options on proxied responses")]
    lenient_headers: bool,

    #[clap(long, help = "Also rewrite root-relative URLs passed to fetch/XHR/Request/URL")]
    rewrite_script_calls: bool,

    #[clap(long, help = "Return upstream redirects instead of following them")]
    no_follow_redirects: bool,

    #[clap(long, value_name = "NUM", help = "Maximum redirects followed per request")]
    max_redirects: Option<usize>,

    #[clap(long, value_name = "SECONDS", help = "Timeout for upstream content fetches")]
    fetch_timeout: Option<u64>,

    #[clap(long, value_name = "SECONDS", help = "Timeout for domain lookups")]
    lookup_timeout: Option<u64>,

    #[clap(long, value_name = "NUM", help = "Maximum idle connections per host")]
    pool_max_idle: Option<usize>,

    #[clap(long, value_name = "FILE", help = "Private key file path for HTTPS")]
    private_key: Option<String>,

    #[clap(long, value_name = "FILE", help = "Certificate file path for HTTPS")]
    certificate: Option<String>,

    #[clap(long, value_name = "FILE", help = "Generate a sample configuration file")]
    generate_config: Option<String>,

    #[clap(long, value_name = "URL", help = "Load a page through the proxy endpoints and print the framed document")]
    render: Option<String>,

    #[clap(long, value_name = "PREFIX", help = "Proxy endpoint for --render (e.g., https://proxy.example.com?url=), repeatable")]
    endpoint: Vec<String>,

    #[clap(long, value_name = "LEVEL", help = "Log level: trace, debug, info, warn, error")]
    log_level: Option<String>,

    #[clap(long, value_name = "FORMAT", help = "Log format: text or json")]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if let Some(config_file) = &args.generate_config {
        generate_sample_config(config_file)?;
        println!("Sample configuration file generated: {}", config_file);
        return Ok(());
    }

    let mut config = match &args.config {
        Some(config_file) => {
            if !Path::new(config_file).exists() {
                bail!("Configuration file not found: {}", config_file);
            }
            Config::from_file(config_file)
                .map_err(|e| anyhow::anyhow!("{}", e))
                .with_context(|| format!("Failed to load {}", config_file))?
        }
        None => Config::default(),
    };

    init_logging(&args, config.logging.clone())?;
    if let Some(level) = config.logging.as_ref().and_then(|l| l.level.as_ref()) {
        debug!("Configured log level: {}", level);
    }

    config.apply_env()?;
    apply_args(&mut config, &args)?;
    config.validate()?;

    if let Some(url) = &args.render {
        return render(&config, &args.endpoint, url).await;
    }

    info!("Starting proxy server...");
    let proxy = ProxyFactory::create_proxy(config)?;

    let server_handle = tokio::spawn(async move { proxy.run().await });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
        result = server_handle => {
            match result {
                Ok(Err(e)) => {
                    error!("Server error: {}", e);
                    return Err(e.into());
                }
                Err(e) => error!("Server task error: {}", e),
                Ok(Ok(())) => {}
            }
        }
    }

    info!("Proxy server stopped");
    Ok(())
}

fn init_logging(args: &Args, logging: Option<LoggingConfig>) -> anyhow::Result<()> {
    match logging {
        Some(mut logging) => {
            if let Some(level) = &args.log_level {
                logging.level = Some(parse_log_level(level).map_err(|e| anyhow::anyhow!("{}", e))?);
            }
            if let Some(format) = &args.log_format {
                logging.format = Some(parse_log_format(format).map_err(|e| anyhow::anyhow!("{}", e))?);
            }
            CustomLogger::init(logging).map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
        }
        None => init_fallback(args.log_level.as_deref(), args.log_format.as_deref())
            .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e)),
    }
}

fn apply_args(config: &mut Config, args: &Args) -> anyhow::Result<()> {
    if let Some(mode) = &args.mode {
        config.mode = match mode.as_str() {
            "rewrite" => ProxyMode::Rewrite,
            "domain" => ProxyMode::Domain,
            _ => bail!("Invalid mode '{}'. Use 'rewrite' or 'domain'", mode),
        };
    }
    if let Some(listen) = &args.listen {
        config.listen_addr = listen
            .parse()
            .with_context(|| format!("Invalid listen address: {}", listen))?;
    }
    if args.public_origin.is_some() {
        config.public_origin = args.public_origin.clone();
    }
    if args.backend_url.is_some() {
        config.backend_url = args.backend_url.clone();
    }
    if args.lenient_headers {
        config.strict_headers = false;
    }
    if args.rewrite_script_calls {
        config.rewrite_script_calls = true;
    }
    if args.no_follow_redirects {
        config.follow_redirects = false;
    }
    if let Some(max) = args.max_redirects {
        config.max_redirects = max;
    }
    if args.fetch_timeout.is_some() {
        config.fetch_timeout_secs = args.fetch_timeout;
    }
    if args.lookup_timeout.is_some() {
        config.lookup_timeout_secs = args.lookup_timeout;
    }
    if let Some(pool) = args.pool_max_idle {
        config.pool_max_idle_per_host = pool;
    }
    if args.private_key.is_some() {
        config.private_key = args.private_key.clone();
    }
    if args.certificate.is_some() {
        config.certificate = args.certificate.clone();
    }
    Ok(())
}

async fn render(config: &Config, endpoints: &[String], url: &str) -> anyhow::Result<()> {
    let mut embed = config.embed.clone().unwrap_or_default();
    if !endpoints.is_empty() {
        embed.endpoints = endpoints.to_vec();
    }

    let upstream = HttpUpstream::new(config.pool_max_idle_per_host)
        .with_redirects(config.follow_redirects, config.max_redirects);
    let loader = FrameLoader::from_config(&embed, Arc::new(upstream))?;

    match loader.set_source(url).await? {
        LoadOutcome::Loaded { endpoint } => {
            info!("Rendered {} through {}", url, endpoint);
            println!("{}", loader.document().await);
            Ok(())
        }
        LoadOutcome::Ignored => bail!("Not an http(s) URL: {}", url),
        LoadOutcome::Failed => bail!("Every proxy endpoint failed for {}", url),
    }
}

fn generate_sample_config(file_path: &str) -> anyhow::Result<()> {
    let path = Path::new(file_path);
    let extension = path.extension().and_then(|s| s.to_str());

    let mut config = Config {
        public_origin: Some("https://proxy.example.com".to_string()),
        fetch_timeout_secs: Some(30),
        logging: Some(LoggingConfig::default()),
        ..Config::default()
    };

    match extension {
        Some("domain") => {
            config.mode = ProxyMode::Domain;
            config.public_origin = None;
            config.backend_url = Some("https://app.example.com".to_string());
        }
        _ => {
            config.embed = Some(EmbedConfig {
                endpoints: vec![
                    "https://proxy.example.com?url=".to_string(),
                    "https://proxy-backup.example.com?url=".to_string(),
                ],
                fetch_timeout_secs: Some(15),
            });
        }
    }

    config
        .to_file(file_path)
        .map_err(|e| anyhow::anyhow!("Failed to write {}: {}", file_path, e))
}
