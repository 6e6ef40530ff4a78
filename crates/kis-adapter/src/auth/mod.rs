/*
[INPUT]:  Credentials per domain and token endpoints
[OUTPUT]: Bearer tokens, cached tokens, approval keys and credential lookups
[POS]:    Auth layer - handles KIS API authentication
[UPDATE]: When auth flow or token storage changes
*/

pub mod approval;
pub mod credentials;
pub mod manager;
pub mod token;

pub use approval::{ApprovalKeySource, StaticApprovalKey};
pub use credentials::{AppKey, KisCredentials};
pub use manager::TokenManager;
pub use token::{AccessToken, TokenCache};
