/*
[INPUT]:  Error sources (HTTP, provider body codes, serialization, auth, WebSocket)
[OUTPUT]: Structured error types with context and retry hints
[POS]:    Error handling layer - unified error types for entire crate
[UPDATE]: When adding new error sources or improving error messages
*/

use reqwest::StatusCode;
use thiserror::Error;

/// Provider code: too many requests per second.
pub const MSG_CD_THROTTLED: &str = "EGW00201";
/// Provider code: access token expired.
pub const MSG_CD_TOKEN_EXPIRED: &str = "EGW00123";
/// Provider code: access token invalid.
pub const MSG_CD_TOKEN_INVALID: &str = "EGW00121";

/// Main error type for the KIS adapter
#[derive(Error, Debug)]
pub enum KisError {
    /// HTTP request failed before a response was received
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// Provider returned a non-zero `rt_cd`
    #[error("API error [{msg_cd}] (rt_cd {rt_cd}, HTTP {status}): {message}")]
    Api {
        status: u16,
        rt_cd: String,
        msg_cd: String,
        message: String,
    },

    /// 5xx without a provider code
    #[error("Server error (HTTP {status}): {body}")]
    Server { status: u16, body: String },

    /// 4xx without a provider code; body is already redacted
    #[error("Request rejected (HTTP {status}): {body}")]
    Client { status: u16, body: String },

    /// Token issuance failed
    #[error("Authentication failed: {message}")]
    Authentication { message: String },

    /// Missing or invalid credentials/configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Caller misuse, raised before any I/O
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// URL parsing failed
    #[error("Invalid URL: {0}")]
    UrlParse(#[from] url::ParseError),

    /// Local file error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// WebSocket transport error
    #[error("WebSocket error: {0}")]
    WebSocket(String),

    /// Malformed or unrecognized streaming frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid response from server
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Concurrent subscription cap reached
    #[error("Subscription limit of {limit} reached")]
    SubscriptionLimit { limit: usize },

    /// Frame decryption failed
    #[error("Decryption failed: {0}")]
    Decrypt(String),

    /// Streaming client has no open connection
    #[error("WebSocket not connected")]
    NotConnected,
}

impl KisError {
    /// Transport-level failures worth retrying with backoff.
    ///
    /// Only a 5xx without a provider code counts; a 5xx carrying a `msg_cd`
    /// is an `Api` error and is retried only for the throttle and token codes.
    pub fn is_retryable(&self) -> bool {
        match self {
            KisError::Http(err) => !err.is_builder() && !err.is_decode(),
            KisError::Server { .. } | KisError::WebSocket(_) => true,
            _ => false,
        }
    }

    /// Provider "slow down" signal
    pub fn is_rate_limited(&self) -> bool {
        self.msg_cd() == Some(MSG_CD_THROTTLED)
    }

    /// Provider says the bearer token is no longer usable
    pub fn is_token_expired(&self) -> bool {
        matches!(
            self.msg_cd(),
            Some(MSG_CD_TOKEN_EXPIRED) | Some(MSG_CD_TOKEN_INVALID)
        )
    }

    /// Check if error indicates authentication failure
    pub fn is_auth_error(&self) -> bool {
        matches!(self, KisError::Authentication { .. }) || self.is_token_expired()
    }

    /// Provider message code, if this is a body-level error
    pub fn msg_cd(&self) -> Option<&str> {
        match self {
            KisError::Api { msg_cd, .. } => Some(msg_cd.as_str()),
            _ => None,
        }
    }

    /// Create an error from a status code and an already-redacted body
    pub fn from_status(status: StatusCode, body: impl Into<String>) -> Self {
        if status.is_server_error() {
            KisError::Server {
                status: status.as_u16(),
                body: body.into(),
            }
        } else {
            KisError::Client {
                status: status.as_u16(),
                body: body.into(),
            }
        }
    }
}

/// Result type alias for KIS operations
pub type Result<T> = std::result::Result<T, KisError>;
