//! Configuration for the cache manager, origin, proxy and storage paths.

use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::version::CacheVersion;

/// Which source a cacheable request consults first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    /// Try the network, fall back to the stored copy.
    #[default]
    NetworkFirst,
    /// Serve the stored copy, go to the network only on a miss.
    CacheFirst,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NetworkFirst => f.write_str("network-first"),
            Self::CacheFirst => f.write_str("cache-first"),
        }
    }
}

/// Configuration for the offline cache.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache names are `"{prefix}-{version}"`.
    pub prefix: String,
    /// Current asset-set version.
    pub version: CacheVersion,
    /// Fetch policy for cacheable requests.
    pub strategy: Strategy,
    /// URLs fetched and stored at install time, in order.
    pub precache: Vec<String>,
    /// Page served to offline navigations with no cached copy.
    pub offline_url: String,
    /// Regular expressions for URLs that always bypass the cache.
    pub bypass: Vec<String>,
    /// Path suffixes that mark a response as cacheable (cache-first).
    pub cacheable_extensions: Vec<String>,
    /// Media type prefixes that mark a response as cacheable (cache-first).
    pub cacheable_content_types: Vec<String>,
    /// Whether a finished install activates without waiting for clients.
    pub skip_waiting_on_install: bool,
    /// Maximum number of concurrent precache fetches.
    pub install_concurrency: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            prefix: "lista-presentes".to_string(),
            version: CacheVersion::default(),
            strategy: Strategy::NetworkFirst,
            precache: [
                "/",
                "/static/manifest.json",
                "/static/icons/icon-192x192.svg",
                "/static/icons/icon-512x512.svg",
            ]
            .map(String::from)
            .to_vec(),
            offline_url: "/".to_string(),
            bypass: ["/api/", r"/apex_util\.", r"wwv_flow\.ajax"]
                .map(String::from)
                .to_vec(),
            cacheable_extensions: [
                ".css", ".js", ".png", ".jpg", ".jpeg", ".gif", ".svg", ".woff", ".woff2",
            ]
            .map(String::from)
            .to_vec(),
            cacheable_content_types: [
                "text/css",
                "text/javascript",
                "application/javascript",
                "application/manifest+json",
                "image/",
                "font/",
            ]
            .map(String::from)
            .to_vec(),
            skip_waiting_on_install: true,
            install_concurrency: 4,
        }
    }
}

impl CacheConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cache name for the configured version.
    #[must_use]
    pub fn cache_name(&self) -> String {
        self.version.cache_name(&self.prefix)
    }

    /// Sets the cache version.
    #[must_use]
    pub fn with_version(mut self, version: CacheVersion) -> Self {
        self.version = version;
        self
    }

    /// Sets the fetch strategy.
    #[must_use]
    pub const fn with_strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Replaces the precache list.
    #[must_use]
    pub fn with_precache<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.precache = urls.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the offline fallback page.
    #[must_use]
    pub fn with_offline_url(mut self, url: impl Into<String>) -> Self {
        self.offline_url = url.into();
        self
    }

    /// Sets whether install signals immediate activation.
    #[must_use]
    pub const fn with_skip_waiting_on_install(mut self, skip: bool) -> Self {
        self.skip_waiting_on_install = skip;
        self
    }

    /// Sets the number of concurrent precache fetches.
    #[must_use]
    pub const fn with_install_concurrency(mut self, concurrency: usize) -> Self {
        self.install_concurrency = concurrency;
        self
    }
}

/// Origin server the cache fronts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OriginConfig {
    /// Base URL that relative precache entries resolve against.
    pub url: String,
    /// Per-request timeout in seconds.
    pub timeout_secs: u64,
    /// User agent sent to the origin.
    pub user_agent: String,
}

impl Default for OriginConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:8000/".to_string(),
            timeout_secs: 10,
            user_agent: concat!("giftcache/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl OriginConfig {
    /// Parses the origin URL.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured URL is not absolute.
    pub fn base_url(&self) -> crate::Result<Url> {
        crate::url::parse(&self.url)
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Reverse-proxy host configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Largest request body forwarded, in bytes.
    pub max_body_bytes: usize,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            max_body_bytes: 10 * 1024 * 1024,
        }
    }
}

/// Storage locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Root directory holding one subdirectory per named cache.
    pub cache_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
        }
    }
}

impl PathConfig {
    /// File holding the persisted worker registration.
    #[must_use]
    pub fn registration_path(&self) -> PathBuf {
        self.cache_dir.join("registration.toml")
    }
}

/// Uses `CACHE_DIRECTORY` (set by systemd when `CacheDirectory=` is configured),
/// falling back to `$XDG_CACHE_HOME/giftcache`.
fn default_cache_dir() -> PathBuf {
    std::env::var("CACHE_DIRECTORY").map_or_else(
        |_| {
            dirs::cache_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("giftcache")
        },
        PathBuf::from,
    )
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub cache: CacheConfig,
    pub origin: OriginConfig,
    pub proxy: ProxyConfig,
    pub paths: PathConfig,
}

impl AppConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Default config file location: `$XDG_CONFIG_HOME/giftcache/config.toml`.
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("giftcache")
            .join("config.toml")
    }

    /// Loads configuration from a TOML file. Missing keys take defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> crate::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&contents)?)
    }

    /// Loads the config, writing a default template first if none exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read, parsed or created.
    pub fn load_or_create(path: &Path) -> crate::Result<Self> {
        if path.exists() {
            return Self::load(path);
        }
        let config = Self::default();
        config.save(path)?;
        log::info!("Wrote default config to {}", path.display());
        Ok(config)
    }

    /// Saves the config atomically (write tmp + rename).
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file written.
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let tmp_path = path.with_extension("toml.tmp");
        std::fs::write(&tmp_path, toml::to_string_pretty(self)?)?;
        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }
}
