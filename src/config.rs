use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::http_client::HttpClientConfig;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    /// SQLite database file
    #[serde(default = "default_db_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    /// Timeout for HTTP requests in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Maximum number of retry attempts for failed requests
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Initial retry delay in milliseconds
    #[serde(default = "default_initial_retry_delay")]
    pub initial_retry_delay_ms: u64,

    /// Maximum retry delay in milliseconds
    #[serde(default = "default_max_retry_delay")]
    pub max_retry_delay_ms: u64,

    /// Fixed user agent; rotated browser agents are used when unset
    #[serde(default)]
    pub user_agent: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    #[serde(default)]
    pub mangadex: MangaDexConfig,
    #[serde(default)]
    pub zonatmo: ZonaTmoConfig,
    #[serde(default)]
    pub mangaplus: MangaPlusConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MangaDexConfig {
    #[serde(default = "default_mangadex_api")]
    pub base_url: String,
    #[serde(default = "default_mangadex_covers")]
    pub cover_base_url: String,
    #[serde(default = "default_mangadex_web")]
    pub web_url: String,
    /// Locales tried in order for multi-locale title/description fields
    #[serde(default = "default_locale_preference")]
    pub locale_preference: Vec<String>,
    /// Translated languages requested from the chapter feed
    #[serde(default = "default_chapter_languages")]
    pub chapter_languages: Vec<String>,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ZonaTmoConfig {
    #[serde(default = "default_zonatmo_url")]
    pub base_url: String,
    /// Mandatory delay before every request, in milliseconds
    #[serde(default = "default_scrape_delay")]
    pub delay_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MangaPlusConfig {
    #[serde(default = "default_mangaplus_api")]
    pub api_url: String,
    #[serde(default = "default_mangaplus_web")]
    pub web_url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    /// Deadline for one multi-source search fan-out, in seconds
    #[serde(default = "default_search_timeout")]
    pub search_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    /// Root directory of the local blob store
    #[serde(default = "default_storage_root")]
    pub root: String,
    #[serde(default = "default_public_base")]
    pub public_base_url: String,
}

fn default_host() -> String { "127.0.0.1".to_string() }
fn default_port() -> u16 { 8080 }
fn default_db_path() -> String { "manga.db".to_string() }
fn default_timeout() -> u64 { 15 }
fn default_max_retries() -> usize { 2 }
fn default_initial_retry_delay() -> u64 { 500 }
fn default_max_retry_delay() -> u64 { 8000 }
fn default_mangadex_api() -> String { "https://api.mangadex.org".to_string() }
fn default_mangadex_covers() -> String { "https://uploads.mangadex.org/covers".to_string() }
fn default_mangadex_web() -> String { "https://mangadex.org".to_string() }
fn default_locale_preference() -> Vec<String> { vec!["en".to_string(), "es".to_string()] }
fn default_chapter_languages() -> Vec<String> { vec!["es".to_string()] }
fn default_page_size() -> u32 { 100 }
fn default_zonatmo_url() -> String { "https://zonatmo.com".to_string() }
fn default_scrape_delay() -> u64 { 1000 }
fn default_mangaplus_api() -> String { "https://jumpg-webapi.tokyo-cdn.com/api".to_string() }
fn default_mangaplus_web() -> String { "https://mangaplus.shueisha.co.jp".to_string() }
fn default_search_timeout() -> u64 { 20 }
fn default_storage_root() -> String { "storage".to_string() }
fn default_public_base() -> String { "http://127.0.0.1:8080/storage".to_string() }

impl Default for ServerConfig {
    fn default() -> Self {
        Self { host: default_host(), port: default_port() }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { path: default_db_path() }
    }
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            initial_retry_delay_ms: default_initial_retry_delay(),
            max_retry_delay_ms: default_max_retry_delay(),
            user_agent: None,
        }
    }
}

impl Default for MangaDexConfig {
    fn default() -> Self {
        Self {
            base_url: default_mangadex_api(),
            cover_base_url: default_mangadex_covers(),
            web_url: default_mangadex_web(),
            locale_preference: default_locale_preference(),
            chapter_languages: default_chapter_languages(),
            page_size: default_page_size(),
        }
    }
}

impl Default for ZonaTmoConfig {
    fn default() -> Self {
        Self { base_url: default_zonatmo_url(), delay_ms: default_scrape_delay() }
    }
}

impl Default for MangaPlusConfig {
    fn default() -> Self {
        Self { api_url: default_mangaplus_api(), web_url: default_mangaplus_web() }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self { search_timeout_secs: default_search_timeout() }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self { root: default_storage_root(), public_base_url: default_public_base() }
    }
}

impl Config {
    /// Load `config.toml` (or `$MANGAFLOW_CONFIG`), falling back to defaults.
    pub fn load() -> Self {
        let path = std::env::var("MANGAFLOW_CONFIG").unwrap_or_else(|_| "config.toml".to_string());
        let mut cfg = Self::load_from(Path::new(&path));
        cfg.apply_env_overrides(|key| std::env::var(key).ok());
        cfg
    }

    pub fn load_from(path: &Path) -> Self {
        if path.exists() {
            match fs::read_to_string(path) {
                Ok(content) => match Self::parse(&content) {
                    Ok(cfg) => return cfg,
                    Err(e) => log::warn!("Ignoring invalid {}: {}", path.display(), e),
                },
                Err(e) => log::warn!("Could not read {}: {}", path.display(), e),
            }
        }
        Self::default()
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str::<Config>(content)
    }

    /// Environment variables take precedence over file values.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(delay) = lookup("SCRAPER_DELAY_MS").and_then(|v| v.parse::<u64>().ok()) {
            self.sources.zonatmo.delay_ms = delay;
        }
        if let Some(ua) = lookup("SCRAPER_USER_AGENT").filter(|v| !v.trim().is_empty()) {
            self.http.user_agent = Some(ua);
        }
        if let Some(db) = lookup("DATABASE_PATH").filter(|v| !v.trim().is_empty()) {
            self.database.path = db;
        }
    }

    pub fn search_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.search_timeout_secs)
    }
}

impl HttpConfig {
    /// Build the transport settings shared by every adapter.
    pub fn client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.timeout_secs),
            max_retries: self.max_retries,
            initial_retry_delay_ms: self.initial_retry_delay_ms,
            max_retry_delay_ms: self.max_retry_delay_ms,
            user_agent: self.user_agent.clone(),
            ..HttpClientConfig::default()
        }
    }
}
