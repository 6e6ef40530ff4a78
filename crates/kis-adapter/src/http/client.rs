/*
[INPUT]:  HTTP configuration (base URLs, timeouts, quotas, credentials)
[OUTPUT]: Configured KIS client owning its token manager and rate limiters
[POS]:    HTTP layer - core client implementation
[UPDATE]: When adding connection options or changing client behavior
*/

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Url};

use crate::auth::{KisCredentials, TokenCache, TokenManager};
use crate::http::rate_limit::{REAL_REQUESTS_PER_SECOND, VIRTUAL_REQUESTS_PER_SECOND};
use crate::http::{RateLimiter, Result, RetryPolicy};
use crate::types::Domain;

/// Base URLs for the KIS Open API
pub const REAL_REST_URL: &str = "https://openapi.koreainvestment.com:9443";
pub const VIRTUAL_REST_URL: &str = "https://openapivts.koreainvestment.com:29443";
pub const REAL_WS_URL: &str = "ws://ops.koreainvestment.com:21000";
pub const VIRTUAL_WS_URL: &str = "ws://ops.koreainvestment.com:31000";

/// Customer type header: individual.
pub const DEFAULT_CUSTTYPE: &str = "P";

/// Parsed per-domain endpoints.
#[derive(Debug, Clone)]
pub struct Endpoints {
    real_rest: Url,
    virtual_rest: Url,
    real_ws: String,
    virtual_ws: String,
}

impl Endpoints {
    pub fn new(real_rest: &str, virtual_rest: &str, real_ws: &str, virtual_ws: &str) -> Result<Self> {
        Ok(Self {
            real_rest: Url::parse(real_rest)?,
            virtual_rest: Url::parse(virtual_rest)?,
            real_ws: real_ws.to_string(),
            virtual_ws: virtual_ws.to_string(),
        })
    }

    /// Production WebSocket URLs with custom REST base URLs.
    pub fn with_base_urls(real_rest: &str, virtual_rest: &str) -> Result<Self> {
        Self::new(real_rest, virtual_rest, REAL_WS_URL, VIRTUAL_WS_URL)
    }

    pub fn rest(&self, domain: Domain) -> &Url {
        match domain {
            Domain::Real => &self.real_rest,
            Domain::Virtual => &self.virtual_rest,
        }
    }

    pub fn ws(&self, domain: Domain) -> &str {
        match domain {
            Domain::Real => &self.real_ws,
            Domain::Virtual => &self.virtual_ws,
        }
    }
}

/// HTTP client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub real_url: String,
    pub virtual_url: String,
    pub real_ws_url: String,
    pub virtual_ws_url: String,
    /// Requests per `rate_period` on the real domain
    pub real_rate: u32,
    /// Requests per `rate_period` on the virtual domain
    pub virtual_rate: u32,
    pub rate_period: Duration,
    /// Backoff for transport failures and 5xx
    pub retry: RetryPolicy,
    /// Pause after a provider "slow down" response
    pub throttle_delay: Duration,
    pub throttle_max_attempts: u32,
    /// Directory for the token cache; `None` disables it
    pub token_cache_dir: Option<PathBuf>,
    pub custtype: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            real_url: REAL_REST_URL.to_string(),
            virtual_url: VIRTUAL_REST_URL.to_string(),
            real_ws_url: REAL_WS_URL.to_string(),
            virtual_ws_url: VIRTUAL_WS_URL.to_string(),
            real_rate: REAL_REQUESTS_PER_SECOND,
            virtual_rate: VIRTUAL_REQUESTS_PER_SECOND,
            rate_period: Duration::from_secs(1),
            retry: RetryPolicy::rest(),
            throttle_delay: Duration::from_millis(100),
            throttle_max_attempts: 10,
            token_cache_dir: None,
            custtype: DEFAULT_CUSTTYPE.to_string(),
        }
    }
}

impl ClientConfig {
    /// Point both REST domains somewhere else (mock servers, proxies).
    pub fn with_base_urls(mut self, real_url: &str, virtual_url: &str) -> Self {
        self.real_url = real_url.to_string();
        self.virtual_url = virtual_url.to_string();
        self
    }

    /// Enable the token cache under `dir`.
    pub fn with_token_cache(mut self, dir: impl Into<PathBuf>) -> Self {
        self.token_cache_dir = Some(dir.into());
        self
    }

    /// Default cache location: `./.kis-config/tokens` under the working directory.
    pub fn default_token_cache_dir() -> PathBuf {
        let base_dir = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        base_dir.join(".kis-config").join("tokens")
    }

    fn endpoints(&self) -> Result<Endpoints> {
        Endpoints::new(
            &self.real_url,
            &self.virtual_url,
            &self.real_ws_url,
            &self.virtual_ws_url,
        )
    }
}

/// Main HTTP client for the KIS API
#[derive(Debug)]
pub struct KisClient {
    pub(crate) http_client: Client,
    pub(crate) endpoints: Endpoints,
    pub(crate) credentials: Arc<KisCredentials>,
    pub(crate) tokens: TokenManager,
    real_limiter: RateLimiter,
    virtual_limiter: RateLimiter,
    pub(crate) config: ClientConfig,
}

impl KisClient {
    /// Create a new client with default configuration
    pub fn new(credentials: KisCredentials) -> Result<Self> {
        Self::with_config(credentials, ClientConfig::default())
    }

    /// Create a new client with custom configuration
    pub fn with_config(credentials: KisCredentials, config: ClientConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;

        let endpoints = config.endpoints()?;
        let credentials = Arc::new(credentials);
        let cache = config.token_cache_dir.as_ref().map(TokenCache::new);
        let tokens = TokenManager::new(
            http_client.clone(),
            endpoints.clone(),
            credentials.clone(),
            cache,
        );

        Ok(Self {
            http_client,
            endpoints,
            credentials,
            tokens,
            real_limiter: RateLimiter::new(config.real_rate, config.rate_period),
            virtual_limiter: RateLimiter::new(config.virtual_rate, config.rate_period),
            config,
        })
    }

    pub fn credentials(&self) -> &KisCredentials {
        &self.credentials
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    pub fn tokens(&self) -> &TokenManager {
        &self.tokens
    }

    /// Rate limiter guarding `domain`
    pub fn limiter(&self, domain: Domain) -> &RateLimiter {
        match domain {
            Domain::Real => &self.real_limiter,
            Domain::Virtual => &self.virtual_limiter,
        }
    }
}
