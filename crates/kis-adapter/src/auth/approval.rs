/*
[INPUT]:  Domain the streaming session is opened on
[OUTPUT]: WebSocket approval key for that domain
[POS]:    Auth layer - seam between the REST client and the streaming client
[UPDATE]: When approval key sourcing changes
*/

use async_trait::async_trait;

use crate::http::Result;
use crate::types::Domain;

/// Source of WebSocket approval keys.
///
/// Implemented by [`crate::KisClient`] through the `/oauth2/Approval` exchange.
/// The trait lets the streaming client run against a fixed key in tests.
#[async_trait]
pub trait ApprovalKeySource: Send + Sync {
    async fn approval_key(&self, domain: Domain) -> Result<String>;
}

/// Approval key known up front.
#[derive(Debug, Clone)]
pub struct StaticApprovalKey {
    key: String,
}

impl StaticApprovalKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

#[async_trait]
impl ApprovalKeySource for StaticApprovalKey {
    async fn approval_key(&self, _domain: Domain) -> Result<String> {
        Ok(self.key.clone())
    }
}
