/*
[INPUT]:  Per-domain app keys
[OUTPUT]: WebSocket approval keys
[POS]:    HTTP layer - approval key exchange for streaming sessions
[UPDATE]: When the approval endpoint or its payload changes
*/

use async_trait::async_trait;
use tracing::info;

use crate::auth::ApprovalKeySource;
use crate::http::redact::{redact_text, truncate_for_log};
use crate::http::{KisClient, KisError, Result};
use crate::types::{ApprovalResponse, Domain};

const APPROVAL_PATH: &str = "/oauth2/Approval";

impl KisClient {
    /// Issue a WebSocket approval key
    ///
    /// POST /oauth2/Approval
    pub async fn issue_approval_key(&self, domain: Domain) -> Result<String> {
        let key = self.credentials.key_for(domain)?;
        let url = self.endpoints.rest(domain).join(APPROVAL_PATH)?;
        let body = serde_json::json!({
            "grant_type": "client_credentials",
            "appkey": key.appkey,
            "secretkey": key.secretkey,
        });

        self.limiter(domain).acquire(None).await;
        let response = self.http_client.post(url).json(&body).send().await?;
        let status = response.status();
        let text = response.text().await?;

        if !status.is_success() {
            let secrets = self.credentials.secrets();
            return Err(KisError::Authentication {
                message: format!(
                    "approval key rejected on {domain} (HTTP {status}): {}",
                    truncate_for_log(&redact_text(&text, &secrets), 512)
                ),
            });
        }

        let parsed: ApprovalResponse = serde_json::from_str(&text)?;
        info!(%domain, "websocket approval key issued");
        Ok(parsed.approval_key)
    }
}

#[async_trait]
impl ApprovalKeySource for KisClient {
    async fn approval_key(&self, domain: Domain) -> Result<String> {
        self.issue_approval_key(domain).await
    }
}
