/*
[INPUT]:  Raw REST response bodies and headers
[OUTPUT]: Typed response envelopes
[POS]:    Data layer - type definitions for API communication
[UPDATE]: When API schema changes or new types added
*/

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::http::{KisError, Result};

/// Body of `POST /oauth2/tokenP`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_in: i64,
    #[serde(default)]
    pub access_token_token_expired: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// Body of `POST /oauth2/Approval`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub approval_key: String,
}

/// Successful REST response.
///
/// Success is decided by the in-body `rt_cd`, not by the HTTP status alone.
#[derive(Debug, Clone)]
pub struct KisResponse {
    pub status: StatusCode,
    /// Continuation flag from the `tr_cont` response header.
    pub tr_cont: Option<String>,
    pub gt_uid: Option<String>,
    pub rt_cd: Option<String>,
    pub msg_cd: Option<String>,
    pub msg1: Option<String>,
    pub body: serde_json::Value,
}

impl KisResponse {
    /// Whether more pages are available (`tr_cont` of `M` or `F`).
    pub fn has_next(&self) -> bool {
        matches!(self.tr_cont.as_deref(), Some("M") | Some("F"))
    }

    /// Deserialize the whole body.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.body.clone())?)
    }

    /// Deserialize the `output` field (falls back to `output1`).
    pub fn output<T: DeserializeOwned>(&self) -> Result<T> {
        let output = self
            .body
            .get("output")
            .or_else(|| self.body.get("output1"))
            .ok_or_else(|| KisError::InvalidResponse("response has no output field".to_string()))?;
        Ok(serde_json::from_value(output.clone())?)
    }
}
