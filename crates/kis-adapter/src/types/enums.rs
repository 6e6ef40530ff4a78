/*
[INPUT]:  API schema definitions and serde requirements
[OUTPUT]: Typed Rust enums with serialization support
[POS]:    Data layer - domains, frame types and lifecycle states
[UPDATE]: When API schema changes or new types added
*/

use std::fmt;

use serde::{Deserialize, Serialize};

/// Trading environment. Each domain has its own credentials, endpoints and rate limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Real,
    Virtual,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Real => "real",
            Domain::Virtual => "virtual",
        }
    }

    /// The other environment.
    pub fn paired(&self) -> Domain {
        match self {
            Domain::Real => Domain::Virtual,
            Domain::Virtual => Domain::Real,
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `tr_type` header of a WebSocket registration frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrType {
    #[serde(rename = "1")]
    Subscribe,
    #[serde(rename = "2")]
    Unsubscribe,
}

impl TrType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrType::Subscribe => "1",
            TrType::Unsubscribe => "2",
        }
    }
}

/// Server-side lifecycle of one streaming subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SubscriptionState {
    #[default]
    Unsubscribed,
    PendingSubscribe,
    Subscribed,
    PendingUnsubscribe,
}

/// Lifecycle of the streaming connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_display_and_pairing() {
        assert_eq!(Domain::Real.to_string(), "real");
        assert_eq!(Domain::Virtual.to_string(), "virtual");
        assert_eq!(Domain::Real.paired(), Domain::Virtual);
        assert_eq!(Domain::Virtual.paired(), Domain::Real);
    }

    #[test]
    fn test_tr_type_wire_values() {
        assert_eq!(serde_json::to_string(&TrType::Subscribe).unwrap(), "\"1\"");
        assert_eq!(serde_json::to_string(&TrType::Unsubscribe).unwrap(), "\"2\"");
        assert_eq!(TrType::Unsubscribe.as_str(), "2");
    }
}
