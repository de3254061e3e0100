//! HTML preparation for documents shown inside an embedding frame.

use regex::{Captures, Regex};
use std::sync::LazyLock;
use url::Url;

/// Rendered into the frame while a load is in flight.
pub const LOADING_PLACEHOLDER: &str = "<!DOCTYPE html><html><head><meta charset=\"utf-8\"></head>\
<body style=\"margin:0;display:flex;align-items:center;justify-content:center;height:100vh;font-family:sans-serif;color:#888\">\
Loading&hellip;</body></html>";

/// Sandbox flags the host frame is expected to carry.
pub const SANDBOX_FLAGS: &str = "allow-forms allow-modals allow-pointer-lock allow-popups \
allow-popups-to-escape-sandbox allow-presentation allow-same-origin allow-scripts \
allow-top-navigation-by-user-activation";

// Parameters are JSON string literals, substituted by `render_interceptor`
const INTERCEPTOR_TEMPLATE: &str = r#"<script>
(function () {
  var TARGET_ORIGIN = {{TARGET_ORIGIN}};
  var PROXY_BASE = {{PROXY_BASE}};
  try {
    PROXY_BASE = new URL(PROXY_BASE, location.href).href;
  } catch (e) {}

  function unwrap(href) {
    if (PROXY_BASE && href.indexOf(PROXY_BASE) === 0) {
      return href.slice(PROXY_BASE.length);
    }
    return href;
  }

  function host() {
    var frame = window.frameElement;
    return frame && typeof frame.load === 'function' ? frame : null;
  }

  document.addEventListener('click', function (e) {
    var link = e.target && e.target.closest ? e.target.closest('a[href]') : null;
    var frame = host();
    if (!link || !frame) return;
    var href = unwrap(link.href);
    if (href.indexOf('http') === 0) {
      e.preventDefault();
      frame.load(href);
    }
  }, true);

  document.addEventListener('submit', function (e) {
    var form = e.target;
    var frame = host();
    if (!frame || !form || form.tagName !== 'FORM') return;
    var action = unwrap(form.getAttribute('action') ? form.action : TARGET_ORIGIN + location.pathname);
    if (action.indexOf('http') !== 0) return;
    e.preventDefault();
    var method = (form.getAttribute('method') || 'GET').toUpperCase();
    var body = new URLSearchParams(new FormData(form)).toString();
    if (method === 'GET') {
      var url = action.split('#')[0];
      frame.load(body ? url + (url.indexOf('?') === -1 ? '?' : '&') + body : url);
    } else {
      frame.load(action, { method: method, body: body });
    }
  }, true);
})();
</script>"#;

static HEAD_OPEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)<head(\s[^>]*)?>").expect("valid head pattern"));

static INTEGRITY_ATTRS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\s(?:crossorigin|integrity)\s*=\s*(?:"[^"]*"|'[^']*')"#).expect("valid attribute pattern")
});

/// Fills the interception script template for one document.
pub fn render_interceptor(target_origin: &str, proxy_base: &str) -> String {
    INTERCEPTOR_TEMPLATE
        .replace("{{TARGET_ORIGIN}}", &script_literal(target_origin))
        .replace("{{PROXY_BASE}}", &script_literal(proxy_base))
}

// JSON string literal that cannot close the surrounding <script> element
fn script_literal(value: &str) -> String {
    serde_json::Value::String(value.to_string())
        .to_string()
        .replace("</", "<\\/")
}

/// Removes `crossorigin` and `integrity` attributes, which would fail once resources come through the proxy.
pub fn strip_integrity_attrs(html: &str) -> String {
    INTEGRITY_ATTRS.replace_all(html, "").into_owned()
}

/// Inserts `<base href>` and `script` right after the first opening `<head>` tag.
///
/// Documents without a head element are returned unchanged.
pub fn inject_head(html: &str, base_url: &Url, script: &str) -> String {
    let base_href = base_url.as_str().replace('"', "&quot;");
    HEAD_OPEN
        .replacen(html, 1, |caps: &Captures| {
            format!(
                "<head{}>\n<base href=\"{}\">\n{}\n",
                caps.get(1).map_or("", |m| m.as_str()),
                base_href,
                script
            )
        })
        .into_owned()
}

/// Serializes a proxy endpoint the way a browser reports `link.href`.
///
/// `https://proxy.example.net?url=` becomes `https://proxy.example.net/?url=`, so
/// prefix checks against normalized anchors match. Unparseable values are kept as given.
pub fn normalize_proxy_base(proxy_base: &str) -> String {
    Url::parse(proxy_base)
        .map(|url| url.to_string())
        .unwrap_or_else(|_| proxy_base.to_string())
}

/// Full preparation of a proxied document before it is handed to the frame.
pub fn prepare_document(html: &str, url: &Url, proxy_base: &str) -> String {
    let script = render_interceptor(&url.origin().ascii_serialization(), &normalize_proxy_base(proxy_base));
    strip_integrity_attrs(&inject_head(html, url, &script))
}
