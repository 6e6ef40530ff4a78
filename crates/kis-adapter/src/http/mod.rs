/*
[INPUT]:  HTTP client configuration, credentials and request descriptions
[OUTPUT]: HTTP responses and typed API results
[POS]:    HTTP layer - REST API communication
[UPDATE]: When adding new endpoints or changing client behavior
*/

pub mod client;
pub mod error;
pub mod oauth;
pub mod rate_limit;
pub mod redact;
pub mod request;
pub mod retry;

pub use error::{KisError, Result};
pub use rate_limit::RateLimiter;
pub use request::KisRequest;
pub use retry::{ErrorClass, RetryPolicy};

pub use client::{ClientConfig, Endpoints, KisClient};
