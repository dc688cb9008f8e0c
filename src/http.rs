//! Request and response snapshots exchanged between pages, caches and the network.

use bytes::Bytes;
use reqwest::Url;
use serde::{Deserialize, Serialize};

pub use reqwest::Method;

/// How the page issued the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RequestMode {
    /// Top-level page navigation.
    Navigate,
    /// Script, stylesheet, image or other subresource.
    #[default]
    Subresource,
}

/// Identity of a cached entry: method plus URL without fragment.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestKey {
    pub method: String,
    pub url: String,
}

impl RequestKey {
    /// Builds the key for a `GET` of `url`.
    #[must_use]
    pub fn get(url: &Url) -> Self {
        Self::new(&Method::GET, url)
    }

    #[must_use]
    pub fn new(method: &Method, url: &Url) -> Self {
        let mut url = url.clone();
        url.set_fragment(None);
        Self {
            method: method.as_str().to_string(),
            url: url.to_string(),
        }
    }
}

/// An outgoing request.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub url: Url,
    pub mode: RequestMode,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Request {
    /// Creates a request with no headers and an empty body.
    #[must_use]
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            mode: RequestMode::Subresource,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    /// Creates a subresource `GET` request.
    #[must_use]
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Creates a navigation `GET` request.
    #[must_use]
    pub fn navigate(url: Url) -> Self {
        Self::get(url).with_mode(RequestMode::Navigate)
    }

    #[must_use]
    pub const fn with_mode(mut self, mode: RequestMode) -> Self {
        self.mode = mode;
        self
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    /// Returns the cache identity of this request.
    #[must_use]
    pub fn key(&self) -> RequestKey {
        RequestKey::new(&self.method, &self.url)
    }

    #[must_use]
    pub fn is_navigation(&self) -> bool {
        self.mode == RequestMode::Navigate
    }

    /// Only `GET` requests are ever read from or written to a cache.
    #[must_use]
    pub fn is_cacheable_method(&self) -> bool {
        self.method == Method::GET
    }
}

/// A response snapshot: status, headers and the full body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub status_text: String,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl Response {
    /// Creates a response with the given status and body and no headers.
    #[must_use]
    pub fn new(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            status_text: reason_phrase(status).to_string(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// The synthesized answer when neither network nor cache can serve a request.
    #[must_use]
    pub fn unavailable() -> Self {
        Self::new(503, "Offline - you are not connected.")
            .with_header("content-type", "text/html; charset=utf-8")
    }

    /// Answer for a pass-through request whose network fetch failed.
    #[must_use]
    pub fn bad_gateway() -> Self {
        Self::new(502, "Bad Gateway").with_header("content-type", "text/plain; charset=utf-8")
    }

    /// True for 2xx statuses.
    #[must_use]
    pub const fn ok(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// Returns the first header value with the given name (case-insensitive).
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Returns the media type without parameters, lowercased.
    #[must_use]
    pub fn content_type(&self) -> Option<String> {
        self.header("content-type").map(|v| {
            v.split(';')
                .next()
                .unwrap_or_default()
                .trim()
                .to_ascii_lowercase()
        })
    }
}

fn reason_phrase(status: u16) -> &'static str {
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("")
}
