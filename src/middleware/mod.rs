//! Request-facing building blocks used by the pipeline stages.
//!
//! - **Request ID**: reuse a sane client `x-request-id` or generate one
//! - **Client address**: forwarding headers honoured only from trusted proxies
//! - **Authentication**: Bearer header or cookie, pluggable token verifiers
//! - **Rate Limiting**: fixed-window counter (default) or GCRA per client key
//!
//! # Security Considerations
//!
//! - Static token comparison is constant-time
//! - Signed tokens are HMAC-SHA256 and verified before their claims are read
//! - Trusted proxy configuration mitigates client address spoofing

pub mod auth;
pub mod ip;
pub mod rate_limit;
pub mod request_id;

pub use auth::{
    Authenticator, ChainVerifier, Credential, DEFAULT_AUTH_COOKIE, Identity,
    SignedTokenVerifier, StaticTokenVerifier, TokenClaims, TokenVerifier, extract_credential,
};
pub use ip::{CidrBlock, TrustedProxies, UNKNOWN_CLIENT, resolve_client_address};
pub use rate_limit::{
    FixedWindowLimiter, GcraLimiter, RateLimitConfigError, RateLimitDecision, RateLimitEntry,
    RateLimitKey, RateLimiter, limiter_from_config, spawn_eviction,
};
pub use request_id::{MAX_REQUEST_ID_LEN, REQUEST_ID_HEADER, resolve_request_id};
