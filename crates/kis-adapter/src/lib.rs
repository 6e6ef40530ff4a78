/*
[INPUT]:  Crate modules and public type definitions
[OUTPUT]: Public KIS adapter crate surface
[POS]:    Crate root - module wiring
[UPDATE]: When public modules or exports change
*/

pub mod auth;
pub mod http;
pub mod kis;
pub mod types;
pub mod ws;

pub use kis::Kis;

// Re-export commonly used types from auth
pub use auth::{
    AccessToken,
    AppKey,
    ApprovalKeySource,
    KisCredentials,
    StaticApprovalKey,
    TokenCache,
    TokenManager,
};

// Re-export commonly used types from http
pub use http::{
    ClientConfig,
    ErrorClass,
    KisClient,
    KisError,
    KisRequest,
    RateLimiter,
    Result,
    RetryPolicy,
};

// Re-export all types
pub use types::*;

// Re-export commonly used types from ws
pub use ws::{
    FieldSpec,
    FieldValue,
    KisWebSocket,
    Record,
    RecordSchema,
    SchemaRegistry,
    StreamConfig,
    StreamEvent,
    Ticket,
};
