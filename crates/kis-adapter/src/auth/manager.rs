/*
[INPUT]:  Per-domain app keys, HTTP client and optional token cache directory
[OUTPUT]: Valid bearer tokens, issued or renewed on demand
[POS]:    Auth layer - token lifecycle for the REST request engine
[UPDATE]: When token endpoints, renewal triggers or caching change
*/

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use reqwest::Client;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::{AccessToken, AppKey, KisCredentials, TokenCache};
use crate::http::redact::redact_text;
use crate::http::{Endpoints, KisError, Result};
use crate::types::{Domain, TokenResponse};

const TOKEN_PATH: &str = "/oauth2/tokenP";

/// Issues, caches and renews bearer tokens per domain.
///
/// Issuance is single-flight per domain: concurrent callers that find no valid
/// token wait for the one issuing request instead of issuing their own.
#[derive(Debug)]
pub struct TokenManager {
    http: Client,
    endpoints: Endpoints,
    credentials: Arc<KisCredentials>,
    cache: Option<TokenCache>,
    tokens: RwLock<HashMap<Domain, AccessToken>>,
    real_gate: Mutex<()>,
    virtual_gate: Mutex<()>,
    issued: AtomicU64,
}

impl TokenManager {
    pub fn new(
        http: Client,
        endpoints: Endpoints,
        credentials: Arc<KisCredentials>,
        cache: Option<TokenCache>,
    ) -> Self {
        Self {
            http,
            endpoints,
            credentials,
            cache,
            tokens: RwLock::new(HashMap::new()),
            real_gate: Mutex::new(()),
            virtual_gate: Mutex::new(()),
            issued: AtomicU64::new(0),
        }
    }

    /// Number of tokens issued by the server during this manager's lifetime.
    pub fn issued_count(&self) -> u64 {
        self.issued.load(Ordering::SeqCst)
    }

    /// Current in-memory token, if still valid.
    pub fn current(&self, domain: Domain) -> Option<AccessToken> {
        let guard = self
            .tokens
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard
            .get(&domain)
            .filter(|token| !token.is_expired())
            .cloned()
    }

    /// Return a valid token for `domain`, loading or issuing one when needed.
    pub async fn ensure(&self, domain: Domain) -> Result<AccessToken> {
        if let Some(token) = self.current(domain) {
            return Ok(token);
        }

        let _gate = self.gate(domain).lock().await;
        if let Some(token) = self.current(domain) {
            return Ok(token);
        }

        let key = self.credentials.key_for(domain)?;

        if let Some(token) = self.cache.as_ref().and_then(|cache| cache.load(domain, key)) {
            debug!(%domain, expires_at = %token.expires_at, "using cached access token");
            self.remember(token.clone());
            return Ok(token);
        }

        let token = self.issue(domain, key).await?;
        if let Some(cache) = &self.cache
            && let Err(err) = cache.store(&token, key)
        {
            warn!(%domain, error = %err, "failed to write token cache");
        }
        self.remember(token.clone());
        Ok(token)
    }

    /// Forget the token for `domain` so the next `ensure` issues a new one.
    pub fn invalidate(&self, domain: Domain) {
        {
            let mut guard = self
                .tokens
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            guard.remove(&domain);
        }

        if let (Some(cache), Ok(key)) = (&self.cache, self.credentials.key_for(domain)) {
            cache.remove(domain, key);
        }
        debug!(%domain, "access token invalidated");
    }

    fn remember(&self, token: AccessToken) {
        let mut guard = self
            .tokens
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        guard.insert(token.domain, token);
    }

    fn gate(&self, domain: Domain) -> &Mutex<()> {
        match domain {
            Domain::Real => &self.real_gate,
            Domain::Virtual => &self.virtual_gate,
        }
    }

    /// POST /oauth2/tokenP
    async fn issue(&self, domain: Domain, key: &AppKey) -> Result<AccessToken> {
        let url = self.endpoints.rest(domain).join(TOKEN_PATH)?;
        let body = serde_json::json!({
            "grant_type": "client_credentials",
            "appkey": key.appkey,
            "appsecret": key.secretkey,
        });

        let response = self.http.post(url).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;
        let secrets = self.credentials.secrets();

        if !status.is_success() {
            return Err(KisError::Authentication {
                message: format!(
                    "token issuance rejected on {domain} (HTTP {status}): {}",
                    redact_text(&text, &secrets)
                ),
            });
        }

        let parsed: TokenResponse =
            serde_json::from_str(&text).map_err(|err| KisError::Authentication {
                message: format!("malformed token response on {domain}: {err}"),
            })?;

        self.issued.fetch_add(1, Ordering::SeqCst);
        info!(%domain, expires_in = parsed.expires_in, "access token issued");
        Ok(AccessToken::from_response(domain, parsed))
    }
}
