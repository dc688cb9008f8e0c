//! URL resolution and request classification helpers.

use regex::Regex;
use reqwest::Url;

use crate::error::{Error, Result};

/// Resolves `raw` against `origin`. Absolute URLs are returned unchanged.
///
/// # Errors
///
/// Returns [`Error::InvalidUrl`] if `raw` cannot be joined onto `origin`.
pub fn resolve(origin: &Url, raw: &str) -> Result<Url> {
    origin.join(raw).map_err(|e| Error::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })
}

/// Places a request target's path and query on `origin`.
///
/// Unlike [`resolve`], the result always keeps the origin's scheme, host and
/// port, even for targets such as `//other.host/x`.
#[must_use]
pub fn on_origin(origin: &Url, path: &str, query: Option<&str>) -> Url {
    let mut url = origin.clone();
    url.set_path(path);
    url.set_query(query);
    url.set_fragment(None);
    url
}

/// Parses an absolute URL.
///
/// # Errors
///
/// Returns [`Error::InvalidUrl`] if `raw` is not an absolute URL.
pub fn parse(raw: &str) -> Result<Url> {
    Url::parse(raw).map_err(|e| Error::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })
}

/// True for `http` and `https` URLs. Anything else is never intercepted.
#[must_use]
pub fn is_http(url: &Url) -> bool {
    matches!(url.scheme(), "http" | "https")
}

/// True if both URLs share scheme, host and port.
#[must_use]
pub fn same_origin(a: &Url, b: &Url) -> bool {
    a.origin() == b.origin()
}

/// True if the URL path ends with one of `extensions` (case-insensitive).
#[must_use]
pub fn has_extension(url: &Url, extensions: &[String]) -> bool {
    let path = url.path().to_ascii_lowercase();
    extensions
        .iter()
        .any(|ext| path.ends_with(&ext.to_ascii_lowercase()))
}

/// Compiled set of URL patterns whose requests skip the cache entirely.
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    patterns: Vec<Regex>,
}

impl Exclusions {
    /// Compiles the given regular expressions.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Pattern`] if any pattern is not a valid regex.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p.as_ref()))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// True if any pattern matches the full URL.
    #[must_use]
    pub fn matches(&self, url: &Url) -> bool {
        let s = url.as_str();
        self.patterns.iter().any(|re| re.is_match(s))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}
