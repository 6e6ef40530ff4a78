/*
[INPUT]:  HTS id, account number and per-domain app keys supplied by the caller
[OUTPUT]: Credential lookup by domain with configuration errors for gaps
[POS]:    Auth layer - who we are on each domain
[UPDATE]: When credential shape or domain selection rules change
*/

use std::fmt;

use crate::http::{KisError, Result};
use crate::types::{AccountNumber, Domain};

/// App key pair issued per domain.
#[derive(Clone, PartialEq, Eq)]
pub struct AppKey {
    pub appkey: String,
    pub secretkey: String,
}

impl AppKey {
    pub fn new(appkey: impl Into<String>, secretkey: impl Into<String>) -> Self {
        Self {
            appkey: appkey.into(),
            secretkey: secretkey.into(),
        }
    }
}

impl fmt::Debug for AppKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppKey")
            .field("appkey", &"[REDACTED]")
            .field("secretkey", &"[REDACTED]")
            .finish()
    }
}

/// Everything needed to authenticate against one or both domains.
#[derive(Debug, Clone)]
pub struct KisCredentials {
    /// HTS user id, used as the key of execution-notice channels.
    pub id: String,
    pub account: AccountNumber,
    pub real: Option<AppKey>,
    pub virtual_key: Option<AppKey>,
    /// Trade on the virtual domain.
    pub virtual_mode: bool,
}

impl KisCredentials {
    /// Real-domain account.
    pub fn real(id: impl Into<String>, account: &str, key: AppKey) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            account: account.parse()?,
            real: Some(key),
            virtual_key: None,
            virtual_mode: false,
        })
    }

    /// Virtual-domain account. `real` enables market data from the real domain.
    pub fn virtual_account(
        id: impl Into<String>,
        account: &str,
        virtual_key: AppKey,
        real: Option<AppKey>,
    ) -> Result<Self> {
        Ok(Self {
            id: id.into(),
            account: account.parse()?,
            real,
            virtual_key: Some(virtual_key),
            virtual_mode: true,
        })
    }

    /// Credential set for `domain`, or a configuration error when it was not supplied.
    pub fn key_for(&self, domain: Domain) -> Result<&AppKey> {
        let key = match domain {
            Domain::Real => self.real.as_ref(),
            Domain::Virtual => self.virtual_key.as_ref(),
        };
        key.ok_or_else(|| {
            KisError::Config(format!("No app key configured for the {domain} domain"))
        })
    }

    pub fn has_domain(&self, domain: Domain) -> bool {
        self.key_for(domain).is_ok()
    }

    /// Domain orders and balances go to.
    pub fn trading_domain(&self) -> Domain {
        if self.virtual_mode {
            Domain::Virtual
        } else {
            Domain::Real
        }
    }

    /// Domain market data is served from.
    pub fn primary_domain(&self) -> Domain {
        Domain::Real
    }

    /// Secret strings that must never reach logs or errors.
    pub fn secrets(&self) -> Vec<&str> {
        [self.real.as_ref(), self.virtual_key.as_ref()]
            .into_iter()
            .flatten()
            .flat_map(|key| [key.appkey.as_str(), key.secretkey.as_str()])
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_for_missing_domain_is_config_error() {
        let creds = KisCredentials::real("user", "50000000-01", AppKey::new("PSreal", "secret"))
            .unwrap();

        assert!(creds.key_for(Domain::Real).is_ok());
        match creds.key_for(Domain::Virtual) {
            Err(KisError::Config(msg)) => assert!(msg.contains("virtual")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_domain_selection() {
        let creds = KisCredentials::virtual_account(
            "user",
            "50000000-01",
            AppKey::new("PSvirt", "vsecret"),
            Some(AppKey::new("PSreal", "rsecret")),
        )
        .unwrap();

        assert_eq!(creds.trading_domain(), Domain::Virtual);
        assert_eq!(creds.primary_domain(), Domain::Real);
        assert_eq!(creds.secrets().len(), 4);
    }

    #[test]
    fn test_debug_redacts_keys() {
        let key = AppKey::new("PSvisible", "topsecret");
        let rendered = format!("{key:?}");
        assert!(!rendered.contains("PSvisible"));
        assert!(!rendered.contains("topsecret"));
    }
}
