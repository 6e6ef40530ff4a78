/*
[INPUT]:  Request descriptions (method, path, tr_id, params, body, domain)
[OUTPUT]: Parsed responses or classified, redacted errors
[POS]:    HTTP layer - authenticated request engine with throttling and retry
[UPDATE]: When retry classification, headers or response envelope change
*/

use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, Response};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::http::redact::{redact_text, truncate_for_log};
use crate::http::retry::ErrorClass;
use crate::http::{KisClient, KisError, Result, RetryPolicy};
use crate::types::{Domain, KisResponse};

const ERROR_BODY_MAX_BYTES: usize = 1024;
const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// One REST call to make.
#[derive(Debug, Clone)]
pub struct KisRequest {
    pub method: Method,
    pub path: String,
    pub tr_id: String,
    pub params: Vec<(String, String)>,
    pub body: Option<serde_json::Value>,
    /// `None` uses the account's trading domain.
    pub domain: Option<Domain>,
    /// Continuation key for paged queries.
    pub tr_cont: Option<String>,
    pub authenticated: bool,
}

impl KisRequest {
    pub fn new(method: Method, path: impl Into<String>, tr_id: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            tr_id: tr_id.into(),
            params: Vec::new(),
            body: None,
            domain: None,
            tr_cont: None,
            authenticated: true,
        }
    }

    pub fn get(path: impl Into<String>, tr_id: impl Into<String>) -> Self {
        Self::new(Method::GET, path, tr_id)
    }

    pub fn post(path: impl Into<String>, tr_id: impl Into<String>) -> Self {
        Self::new(Method::POST, path, tr_id)
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: serde_json::Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn domain(mut self, domain: Domain) -> Self {
        self.domain = Some(domain);
        self
    }

    pub fn tr_cont(mut self, tr_cont: impl Into<String>) -> Self {
        self.tr_cont = Some(tr_cont.into());
        self
    }

    /// Send without a bearer token.
    pub fn unauthenticated(mut self) -> Self {
        self.authenticated = false;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.method == Method::GET && self.body.is_some() {
            return Err(KisError::InvalidRequest(format!(
                "GET {} ({}) must not carry a body",
                self.path, self.tr_id
            )));
        }
        Ok(())
    }
}

impl KisClient {
    /// Perform a request with token management, throttling and retry.
    ///
    /// - provider "slow down": fixed short delay, bounded attempts
    /// - token expired: one reissue, then the original call once more
    /// - transport failure or 5xx: exponential backoff per `ClientConfig::retry`
    /// - anything else: surfaced immediately
    pub async fn request(&self, request: &KisRequest) -> Result<KisResponse> {
        request.validate()?;
        let domain = request
            .domain
            .unwrap_or_else(|| self.credentials.trading_domain());
        self.credentials.key_for(domain)?;

        let mut transient_attempts: u32 = 0;
        let mut throttled_attempts: u32 = 0;
        let mut reissued = false;

        loop {
            let err = match self.send_once(request, domain).await {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            match RetryPolicy::classify(&err) {
                ErrorClass::Throttled if throttled_attempts < self.config.throttle_max_attempts => {
                    throttled_attempts += 1;
                    debug!(
                        %domain,
                        tr_id = %request.tr_id,
                        attempt = throttled_attempts,
                        "provider throttled request, retrying"
                    );
                    tokio::time::sleep(self.config.throttle_delay).await;
                }
                ErrorClass::TokenExpired if request.authenticated && !reissued => {
                    reissued = true;
                    info!(%domain, tr_id = %request.tr_id, "access token rejected, reissuing");
                    self.tokens.invalidate(domain);
                }
                ErrorClass::Transient => {
                    transient_attempts += 1;
                    if !self.config.retry.should_retry(&err, transient_attempts) {
                        warn!(
                            %domain,
                            tr_id = %request.tr_id,
                            attempts = transient_attempts,
                            error = %err,
                            "request failed, retries exhausted"
                        );
                        return Err(err);
                    }
                    let delay = self.config.retry.delay(transient_attempts);
                    warn!(
                        %domain,
                        tr_id = %request.tr_id,
                        attempt = transient_attempts,
                        ?delay,
                        error = %err,
                        "request failed, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                _ => return Err(err),
            }
        }
    }

    /// `request` followed by deserializing the whole body.
    pub async fn request_json<T: DeserializeOwned>(&self, request: &KisRequest) -> Result<T> {
        self.request(request).await?.json()
    }

    async fn send_once(&self, request: &KisRequest, domain: Domain) -> Result<KisResponse> {
        let token = if request.authenticated {
            Some(self.tokens.ensure(domain).await?)
        } else {
            None
        };

        self.limiter(domain).acquire(None).await;

        let key = self.credentials.key_for(domain)?;
        let url = self.endpoints.rest(domain).join(&request.path)?;

        let mut builder = self
            .http_client
            .request(request.method.clone(), url)
            .header(CONTENT_TYPE, JSON_CONTENT_TYPE)
            .header("appkey", &key.appkey)
            .header("appsecret", &key.secretkey)
            .header("tr_id", &request.tr_id)
            .header("custtype", &self.config.custtype);

        if let Some(token) = &token {
            builder = builder.header(AUTHORIZATION, token.authorization());
        }
        if let Some(tr_cont) = &request.tr_cont {
            builder = builder.header("tr_cont", tr_cont);
        }
        if !request.params.is_empty() {
            builder = builder.query(&request.params);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await?;
        self.interpret(response).await
    }

    async fn interpret(&self, response: Response) -> Result<KisResponse> {
        let status = response.status();
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|value| value.to_str().ok())
                .map(str::to_string)
        };
        let tr_cont = header("tr_cont");
        let gt_uid = header("gt_uid");
        let text = response.text().await?;
        let secrets = self.credentials.secrets();

        let body = match serde_json::from_str::<serde_json::Value>(&text) {
            Ok(body) if body.is_object() => body,
            _ if status.is_success() => {
                return Err(KisError::InvalidResponse(format!(
                    "expected a JSON object (HTTP {status}): {}",
                    truncate_for_log(&redact_text(&text, &secrets), ERROR_BODY_MAX_BYTES)
                )));
            }
            _ => {
                return Err(KisError::from_status(
                    status,
                    truncate_for_log(&redact_text(&text, &secrets), ERROR_BODY_MAX_BYTES),
                ));
            }
        };

        let field = |name: &str| match body.get(name) {
            Some(serde_json::Value::String(value)) => Some(value.clone()),
            Some(serde_json::Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };
        let rt_cd = field("rt_cd");
        let msg_cd = field("msg_cd");
        let msg1 = field("msg1");

        match rt_cd.as_deref() {
            Some("0") => {}
            Some(code) => {
                return Err(KisError::Api {
                    status: status.as_u16(),
                    rt_cd: code.to_string(),
                    msg_cd: msg_cd.unwrap_or_default(),
                    message: redact_text(msg1.as_deref().unwrap_or_default().trim(), &secrets),
                });
            }
            None if status.is_success() => {}
            None => {
                return Err(KisError::from_status(
                    status,
                    truncate_for_log(&redact_text(&text, &secrets), ERROR_BODY_MAX_BYTES),
                ));
            }
        }

        Ok(KisResponse {
            status,
            tr_cont,
            gt_uid,
            rt_cd,
            msg_cd,
            msg1,
            body,
        })
    }
}
