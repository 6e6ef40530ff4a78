/*
[INPUT]:  Raw WebSocket text frames and outgoing registration requests
[OUTPUT]: Registration frames, parsed control messages and event frames
[POS]:    WebSocket layer - message formats and validation
[UPDATE]: When adding new message types or changing format
*/

use serde::{Deserialize, Serialize};

use crate::http::{KisError, Result};
use crate::types::{TrType, TransactionRequest};

/// Keepalive control `tr_id`; the frame must be echoed back verbatim.
pub const PINGPONG_TR_ID: &str = "PINGPONG";

const MSG_SUBSCRIBE_SUCCESS: &str = "SUBSCRIBE SUCCESS";
const MSG_ALREADY_SUBSCRIBED: &str = "ALREADY IN SUBSCRIBE";
const MSG_UNSUBSCRIBE_SUCCESS: &str = "UNSUBSCRIBE SUCCESS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameHeader {
    pub approval_key: String,
    pub custtype: String,
    pub tr_type: TrType,
    #[serde(rename = "content-type")]
    pub content_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FrameBody {
    pub input: TransactionRequest,
}

/// Subscribe/unsubscribe request sent to the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubscriptionFrame {
    pub header: FrameHeader,
    pub body: FrameBody,
}

impl SubscriptionFrame {
    pub fn new(approval_key: &str, custtype: &str, tr_type: TrType, tr: &TransactionRequest) -> Self {
        Self {
            header: FrameHeader {
                approval_key: approval_key.to_string(),
                custtype: custtype.to_string(),
                tr_type,
                content_type: "utf-8".to_string(),
            },
            body: FrameBody { input: tr.clone() },
        }
    }

    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ControlHeader {
    pub tr_id: String,
    #[serde(default)]
    pub tr_key: Option<String>,
    #[serde(default)]
    pub encrypt: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct KeyOutput {
    pub iv: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ControlBody {
    pub rt_cd: String,
    #[serde(default)]
    pub msg_cd: String,
    #[serde(default)]
    pub msg1: String,
    #[serde(default)]
    pub output: Option<KeyOutput>,
}

/// JSON frame from the server: keepalive or subscription result.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ControlMessage {
    pub header: ControlHeader,
    #[serde(default)]
    pub body: Option<ControlBody>,
}

/// Meaning of a subscription result message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionResult {
    /// Subscription active; carries the channel key material when encrypted.
    Subscribed { key: Option<KeyOutput> },
    Unsubscribed,
    Rejected { msg_cd: String, message: String },
    /// Success code with a message we do not know.
    Other(String),
}

impl ControlMessage {
    pub fn is_pingpong(&self) -> bool {
        self.header.tr_id == PINGPONG_TR_ID
    }

    /// Channel this result refers to.
    pub fn tr(&self) -> TransactionRequest {
        TransactionRequest::new(
            self.header.tr_id.clone(),
            self.header.tr_key.clone().unwrap_or_default(),
        )
    }

    pub fn subscription_result(&self) -> Option<SubscriptionResult> {
        let body = self.body.as_ref()?;
        if body.rt_cd != "0" {
            return Some(SubscriptionResult::Rejected {
                msg_cd: body.msg_cd.clone(),
                message: body.msg1.trim().to_string(),
            });
        }

        let result = match body.msg1.trim() {
            MSG_SUBSCRIBE_SUCCESS | MSG_ALREADY_SUBSCRIBED => SubscriptionResult::Subscribed {
                key: body.output.clone(),
            },
            MSG_UNSUBSCRIBE_SUCCESS => SubscriptionResult::Unsubscribed,
            other => SubscriptionResult::Other(other.to_string()),
        };
        Some(result)
    }
}

/// Pipe-delimited data frame: `encrypted|tr_id|count|payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFrame<'a> {
    pub encrypted: bool,
    pub tr_id: &'a str,
    pub count: usize,
    pub payload: &'a str,
}

impl<'a> EventFrame<'a> {
    pub fn parse(text: &'a str) -> Result<Self> {
        let mut parts = text.splitn(4, '|');
        let (Some(flag), Some(tr_id), Some(count), Some(payload)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(KisError::Protocol("event frame has fewer than 4 fields".to_string()));
        };

        let encrypted = match flag {
            "0" => false,
            "1" => true,
            other => {
                return Err(KisError::Protocol(format!("unknown encryption flag {other:?}")));
            }
        };

        if tr_id.is_empty() {
            return Err(KisError::Protocol("event frame without tr_id".to_string()));
        }

        let count = count
            .trim()
            .parse::<usize>()
            .map_err(|_| KisError::Protocol(format!("invalid record count {count:?}")))?;
        if count == 0 {
            return Err(KisError::Protocol("event frame with zero records".to_string()));
        }

        Ok(Self {
            encrypted,
            tr_id,
            count,
            payload,
        })
    }
}

/// Shape of an incoming text frame.
#[derive(Debug)]
pub enum IncomingMessage<'a> {
    Control(ControlMessage),
    Event(EventFrame<'a>),
}

impl<'a> IncomingMessage<'a> {
    pub fn classify(text: &'a str) -> Result<Self> {
        match text.as_bytes().first() {
            Some(b'{') => Ok(IncomingMessage::Control(serde_json::from_str(text)?)),
            Some(b'0') | Some(b'1') => Ok(IncomingMessage::Event(EventFrame::parse(text)?)),
            Some(_) => Err(KisError::Protocol("unrecognized frame shape".to_string())),
            None => Err(KisError::Protocol("empty frame".to_string())),
        }
    }
}
