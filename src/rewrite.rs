//! Pattern-based URL rewriting for HTML, CSS and JavaScript bodies.
//!
//! The rewriter works on raw text with regular expressions. It does not parse
//! the document, so anything the patterns cannot see is left alone:
//!
//! * URLs assembled at runtime (`"https://" + host + "/x"`) are not rewritten.
//! * Rule 1 matches the target hostname as a prefix, so `https://example.com.evil.net`
//!   is rewritten as if it were `https://example.com` followed by `.evil.net`.
//! * Rule 2 treats protocol-relative values (`src="//cdn.example.net/x.js"`) as
//!   root-relative paths.
//!
//! Every byte outside a match is passed through untouched.

use crate::error::ProxyError;
use crate::target::TARGET_QUERY_PARAM;
use regex::{Captures, Regex};
use std::sync::LazyLock;
use url::Url;

const REWRITABLE_TYPES: [&str; 4] = ["text/html", "application/javascript", "text/javascript", "text/css"];

// Rule 2: root-relative values of URL-bearing attributes
static ROOT_RELATIVE_ATTR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)(src|href|url|content)=(["'])/([^"']*)(["'])"#).expect("valid attribute pattern"));

// Rule 3: root-relative CSS url(...) references
static ROOT_RELATIVE_CSS_URL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)url\((["']?)/([^)"']*)(["']?)\)"#).expect("valid css pattern"));

// Optional: root-relative string literals passed to fetch/Request/URL/XHR.open
static SCRIPT_CALL_SITE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)(\bfetch\s*\(\s*|\bnew\s+(?:Request|URL)\s*\(\s*|\.open\s*\(\s*["'][A-Za-z]+["']\s*,\s*)(["'`])/([^/"'`][^"'`]*)?(["'`])"#,
    )
    .expect("valid script call pattern")
});

/// Whether a response with this content type goes through the rewriter.
pub fn is_rewritable(content_type: &str) -> bool {
    let content_type = content_type.to_ascii_lowercase();
    REWRITABLE_TYPES.iter().any(|t| content_type.contains(t))
}

/// Per-request values the rewrite rules are built from.
#[derive(Debug, Clone, PartialEq)]
pub struct RewriteContext {
    /// `scheme://host[:port]` of the target
    pub target_origin: String,
    /// Target hostname, regex-escaped
    pub hostname_pattern: String,
    /// Proxy origin plus its invocation prefix, e.g. `https://proxy.example.com?url=`
    pub proxy_base: String,
}

impl RewriteContext {
    pub fn new(target: &Url, proxy_origin: &str) -> Result<Self, ProxyError> {
        let host = target
            .host_str()
            .ok_or_else(|| ProxyError::InvalidTarget(format!("{} has no host", target)))?;

        Ok(Self {
            target_origin: target.origin().ascii_serialization(),
            hostname_pattern: regex::escape(host),
            proxy_base: proxy_base(proxy_origin),
        })
    }

    /// What every rewritten URL starts with.
    pub fn prefix(&self) -> String {
        format!("{}{}", self.proxy_base, self.target_origin)
    }
}

/// Builds the invocation prefix from the proxy's own origin.
pub fn proxy_base(proxy_origin: &str) -> String {
    format!("{}?{}=", proxy_origin.trim_end_matches('/'), TARGET_QUERY_PARAM)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RewriteOptions {
    /// Also rewrite root-relative literals at fetch/XHR/Request/URL call sites
    pub script_calls: bool,
}

pub struct Rewriter {
    context: RewriteContext,
    absolute_same_origin: Regex,
    options: RewriteOptions,
}

impl Rewriter {
    pub fn new(context: RewriteContext, options: RewriteOptions) -> Result<Self, ProxyError> {
        // Rule 1: absolute URLs on the target host, preceded by a quote, backtick, paren or whitespace
        let absolute_same_origin = Regex::new(&format!(
            r#"(?i)(["'`\s(])https?://{}(/[^"'`\s)]*)?"#,
            context.hostname_pattern
        ))?;

        Ok(Self {
            context,
            absolute_same_origin,
            options,
        })
    }

    pub fn rewrite(&self, content: &str) -> String {
        let prefix = self.context.prefix();

        let content = self.absolute_same_origin.replace_all(content, |caps: &Captures| {
            format!("{}{}{}", &caps[1], prefix, caps.get(2).map_or("", |m| m.as_str()))
        });

        let content = ROOT_RELATIVE_ATTR.replace_all(&content, |caps: &Captures| {
            format!("{}={}{}/{}{}", &caps[1], &caps[2], prefix, &caps[3], &caps[4])
        });

        let content = ROOT_RELATIVE_CSS_URL.replace_all(&content, |caps: &Captures| {
            format!("url({}{}/{}{})", &caps[1], prefix, &caps[2], &caps[3])
        });

        if !self.options.script_calls {
            return content.into_owned();
        }

        SCRIPT_CALL_SITE
            .replace_all(&content, |caps: &Captures| {
                format!(
                    "{}{}{}/{}{}",
                    &caps[1],
                    &caps[2],
                    prefix,
                    caps.get(3).map_or("", |m| m.as_str()),
                    &caps[4]
                )
            })
            .into_owned()
    }
}
