/*
[INPUT]:  Streaming configuration, approval keys, record schemas and subscriptions
[OUTPUT]: Decoded real-time records per subscription ticket
[POS]:    WebSocket layer - real-time data streams
[UPDATE]: When adding message types or changing connection logic
*/

pub mod client;
pub mod keyring;
pub mod message;
pub mod registry;
pub mod schema;

pub use client::{KisWebSocket, MAX_SUBSCRIPTIONS, StreamConfig, StreamEvent, Ticket};
pub use keyring::{EncryptionKey, EncryptionKeyring, PLAINTEXT_TR_IDS, is_plaintext};
pub use message::{
    ControlMessage, EventFrame, IncomingMessage, PINGPONG_TR_ID, SubscriptionFrame,
    SubscriptionResult,
};
pub use registry::{ReleaseOutcome, SubscribeOutcome, SubscriptionRegistry};
pub use schema::{FieldSpec, FieldValue, Record, RecordSchema, SchemaRegistry};
