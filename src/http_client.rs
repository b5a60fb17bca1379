use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, ClientBuilder, Response};
use std::time::Duration;
use tokio::time::sleep;

use crate::error::SourceError;

/// User agents to rotate through to avoid bot detection
const USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
];

#[derive(Clone, Debug)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub max_retries: usize,
    pub initial_retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub enable_cookies: bool,
    pub enable_gzip: bool,
    /// Fixed user agent; when `None` a browser agent is picked per request
    pub user_agent: Option<String>,
    /// Extra default headers, e.g. Origin/Referer for app APIs
    pub default_headers: Vec<(String, String)>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            max_retries: 2,
            initial_retry_delay_ms: 500,
            max_retry_delay_ms: 8000,
            enable_cookies: true,
            enable_gzip: true,
            user_agent: None,
            default_headers: Vec::new(),
        }
    }
}

impl HttpClientConfig {
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.default_headers.push((name.to_string(), value.to_string()));
        self
    }
}

/// HTTP client with retry, backoff and browser-like headers
pub struct EnhancedHttpClient {
    client: Client,
    config: HttpClientConfig,
}

impl EnhancedHttpClient {
    pub fn new() -> Result<Self, SourceError> {
        Self::with_config(HttpClientConfig::default())
    }

    pub fn with_config(config: HttpClientConfig) -> Result<Self, SourceError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("text/html,application/xhtml+xml,application/json;q=0.9,*/*;q=0.8"),
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("es-ES,es;q=0.9,en-US;q=0.8,en;q=0.7"),
        );
        headers.insert("DNT", HeaderValue::from_static("1"));
        for (name, value) in &config.default_headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| SourceError::Parse(format!("invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| SourceError::Parse(format!("invalid header value: {}", e)))?;
            headers.insert(name, value);
        }

        let client = ClientBuilder::new()
            .timeout(config.timeout)
            .cookie_store(config.enable_cookies)
            .gzip(config.enable_gzip)
            .brotli(config.enable_gzip)
            .tcp_keepalive(Some(Duration::from_secs(60)))
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .default_headers(headers)
            .build()?;

        Ok(Self { client, config })
    }

    fn user_agent(&self) -> String {
        match &self.config.user_agent {
            Some(ua) => ua.clone(),
            None => Self::random_user_agent().to_string(),
        }
    }

    fn random_user_agent() -> &'static str {
        let mut rng = rand::thread_rng();
        USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())]
    }

    /// Exponential backoff with ±25% jitter, capped at `max_retry_delay_ms`.
    fn calculate_retry_delay(&self, attempt: usize) -> Duration {
        let base_delay = self.config.initial_retry_delay_ms;
        let delay_ms = base_delay
            .saturating_mul(2u64.saturating_pow(attempt as u32))
            .min(self.config.max_retry_delay_ms);

        let jitter = rand::thread_rng().gen_range(0.75..=1.25);
        Duration::from_millis((delay_ms as f64 * jitter) as u64)
    }

    fn is_retryable_status(status: reqwest::StatusCode) -> bool {
        matches!(
            status.as_u16(),
            429 | 500 | 502 | 503 | 504 | 520 | 521 | 522 | 523 | 524 | 525 | 526 | 527
        )
    }

    /// GET with retries. Non-2xx responses surviving the retries become
    /// `SourceError::Status`.
    pub async fn get(&self, url: &str, query: &[(&str, String)]) -> Result<Response, SourceError> {
        let mut attempt = 0;
        loop {
            let request = self
                .client
                .get(url)
                .query(query)
                .header(reqwest::header::USER_AGENT, self.user_agent());

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if Self::is_retryable_status(status) && attempt < self.config.max_retries {
                        log::warn!(
                            "Received retryable status {} for {}, attempt {}/{}",
                            status,
                            url,
                            attempt + 1,
                            self.config.max_retries + 1
                        );
                        sleep(self.calculate_retry_delay(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    if !status.is_success() {
                        return Err(SourceError::Status { url: url.to_string(), status: status.as_u16() });
                    }
                    return Ok(response);
                }
                Err(e) => {
                    let should_retry = e.is_timeout() || e.is_connect();
                    if should_retry && attempt < self.config.max_retries {
                        log::warn!(
                            "Request failed for {}, attempt {}/{}: {}",
                            url,
                            attempt + 1,
                            self.config.max_retries + 1,
                            e
                        );
                        sleep(self.calculate_retry_delay(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(SourceError::Request(e));
                }
            }
        }
    }

    pub async fn get_text(&self, url: &str, query: &[(&str, String)]) -> Result<String, SourceError> {
        Ok(self.get(url, query).await?.text().await?)
    }

    /// Fetch a binary body together with its content type.
    pub async fn get_bytes(&self, url: &str) -> Result<(Vec<u8>, Option<String>), SourceError> {
        let response = self.get(url, &[]).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());
        let bytes = response.bytes().await?;
        Ok((bytes.to_vec(), content_type))
    }
}
