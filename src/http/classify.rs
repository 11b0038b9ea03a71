//! Target URL derivation and request classification.

use std::borrow::Cow;

use axum::http::{Method, Uri};

/// URL substrings that mark a live smart-HTTP exchange.
pub const GIT_PROTOCOL_MARKERS: [&str; 3] = ["/info/refs", "/git-upload-pack", "/git-receive-pack"];

/// How a proxied request is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestClass {
    /// Ordinary forward; `GET` 200 responses are cached.
    Plain,
    /// Smart-HTTP traffic, never cached.
    GitProtocol,
    /// `GET` of a `.git` URL, served as a packaged archive.
    GitClone,
}

/// Upstream target of one inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    /// Target URL without the query string.  Used for classification and as
    /// the repository URL handed to `git clone`.
    pub url: String,
    /// Target URL with the query string, if any.  This is what is requested
    /// upstream and what the cache key is computed from.
    pub full: String,
}

impl Target {
    /// The path is percent-decoded first, so `/https%3A//host/x` targets
    /// `https://host/x`.  A path that does not decode to UTF-8 is used raw.
    pub fn from_uri(uri: &Uri) -> Self {
        let path = urlencoding::decode(uri.path()).unwrap_or(Cow::Borrowed(uri.path()));
        let url = target_url(&path);
        let full = match uri.query() {
            Some(query) if !query.is_empty() => format!("{url}?{query}"),
            _ => url.clone(),
        };
        Self { url, full }
    }
}

/// Turn the inbound path into the upstream URL.
///
/// `/https://host/x` is used as-is, `/github.com/x` gets an `https://`
/// scheme, anything else is passed through unchanged.
pub fn target_url(path: &str) -> String {
    let raw = path.strip_prefix('/').unwrap_or(path);
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else if raw.starts_with("github.com") {
        format!("https://{raw}")
    } else {
        raw.to_string()
    }
}

fn has_protocol_marker(url: &str) -> bool {
    GIT_PROTOCOL_MARKERS.iter().any(|m| url.contains(m))
}

pub fn classify(url: &str, method: &Method) -> RequestClass {
    let is_repo = url.ends_with(".git");
    let marked = has_protocol_marker(url);

    if is_repo && !marked && method == Method::GET {
        RequestClass::GitClone
    } else if is_repo || marked {
        RequestClass::GitProtocol
    } else {
        RequestClass::Plain
    }
}

/// Download file name for a repository archive: `widgets.git` becomes
/// `widgets.zip`.
pub fn archive_filename(repo_url: &str) -> String {
    let base = repo_url
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default();
    let stem = base.strip_suffix(".git").unwrap_or(base).replace('"', "");
    if stem.is_empty() {
        "repository.zip".to_string()
    } else {
        format!("{stem}.zip")
    }
}
