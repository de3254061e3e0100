pub mod common;
pub mod config;
pub mod document;
pub mod domain_proxy;
pub mod embed;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod rewrite;
pub mod rewrite_proxy;
pub mod sanitize;
pub mod target;
pub mod upstream;

pub use config::{Config, ProxyMode};
pub use embed::{FrameLoader, LoadOutcome, LoadState, Navigation};
pub use error::ProxyError;
pub use proxy::ProxyFactory;
