/*
[INPUT]:  Channel identifiers and account strings
[OUTPUT]: Value types shared by the REST and streaming layers
[POS]:    Data layer - TR identity and account numbers
[UPDATE]: When API schema changes or new types added
*/

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::http::KisError;

/// `(tr_id, tr_key)` pair identifying a REST operation or a streaming channel.
///
/// Equality and hashing are by value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionRequest {
    #[serde(rename = "tr_id")]
    pub id: String,
    #[serde(rename = "tr_key", default)]
    pub key: String,
}

impl TransactionRequest {
    pub fn new(id: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            key: key.into(),
        }
    }

    /// Wire form `{"tr_id": .., "tr_key": ..}`.
    pub fn build(&self) -> serde_json::Value {
        serde_json::json!({
            "tr_id": self.id,
            "tr_key": self.key,
        })
    }
}

impl fmt::Display for TransactionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.key.is_empty() {
            f.write_str(&self.id)
        } else {
            write!(f, "{}.{}", self.id, self.key)
        }
    }
}

/// Brokerage account number: 8-digit account plus 2-digit product code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccountNumber {
    pub number: String,
    pub product_code: String,
}

impl AccountNumber {
    /// `CANO` request field.
    pub fn cano(&self) -> &str {
        &self.number
    }

    /// `ACNT_PRDT_CD` request field.
    pub fn acnt_prdt_cd(&self) -> &str {
        &self.product_code
    }
}

impl FromStr for AccountNumber {
    type Err = KisError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let digits: String = value.trim().chars().filter(|c| *c != '-').collect();
        if digits.len() != 10 || !digits.chars().all(|c| c.is_ascii_digit()) {
            return Err(KisError::Config(format!(
                "Invalid account number {value:?}: expected 8+2 digits such as 50000000-01"
            )));
        }

        Ok(Self {
            number: digits[..8].to_string(),
            product_code: digits[8..].to_string(),
        })
    }
}

impl fmt::Display for AccountNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.number, self.product_code)
    }
}
