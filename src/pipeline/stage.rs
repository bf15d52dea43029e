//! Pipeline stages.
//!
//! Each stage inspects the request, may enrich the context or the parsed
//! input, and either lets the request through or fails it with a typed
//! error. Stages never render responses; that is the boundary's job.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use crate::context::{IncomingRequest, RequestContext};
use crate::error::ApiError;
use crate::logging::RequestLogger;
use crate::metrics;
use crate::middleware::auth::{Authenticator, extract_credential};
use crate::middleware::rate_limit::{RateLimitKey, RateLimiter};
use crate::validation::{Schema, validate};

use super::Input;

/// Stage identity. Declaration order is execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StageKind {
    Authenticate,
    RateLimit,
    Validate,
}

impl StageKind {
    pub fn name(self) -> &'static str {
        match self {
            StageKind::Authenticate => "authenticate",
            StageKind::RateLimit => "rate_limit",
            StageKind::Validate => "validate",
        }
    }
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Mutable view of one request while it moves through the stages.
pub struct Exchange<'a, B, Q> {
    pub request: &'a IncomingRequest,
    pub context: &'a mut RequestContext,
    pub logger: &'a mut RequestLogger,
    pub body: Option<B>,
    pub query: Option<Q>,
}

#[async_trait]
pub trait Stage<B: Input, Q: Input>: Send + Sync {
    fn kind(&self) -> StageKind;

    async fn run(&self, exchange: &mut Exchange<'_, B, Q>) -> Result<(), ApiError>;
}

/// Resolves the caller and records it on the context and log overlay.
#[derive(Clone)]
pub struct AuthenticateStage {
    authenticator: Authenticator,
}

impl AuthenticateStage {
    pub fn new(authenticator: Authenticator) -> Self {
        Self { authenticator }
    }
}

#[async_trait]
impl<B: Input, Q: Input> Stage<B, Q> for AuthenticateStage {
    fn kind(&self) -> StageKind {
        StageKind::Authenticate
    }

    async fn run(&self, exchange: &mut Exchange<'_, B, Q>) -> Result<(), ApiError> {
        let request = exchange.request;
        let headers = &request.headers;
        match self.authenticator.authenticate(headers).await {
            Ok(identity) => {
                exchange.context.set_identity(identity);
                exchange.logger.set_context(exchange.context.identity_fields());
                exchange.logger.debug("Request authenticated");
                Ok(())
            }
            Err(e) => {
                let reason = match extract_credential(headers, self.authenticator.cookie_name()) {
                    Some(_) => "invalid",
                    None => "missing",
                };
                metrics::record_auth_failure(reason);
                Err(e)
            }
        }
    }
}

/// Counts the request against the caller's budget.
#[derive(Clone)]
pub struct RateLimitStage {
    limiter: Arc<dyn RateLimiter>,
    key: RateLimitKey,
}

impl RateLimitStage {
    pub fn new(limiter: Arc<dyn RateLimiter>, key: RateLimitKey) -> Self {
        Self { limiter, key }
    }
}

#[async_trait]
impl<B: Input, Q: Input> Stage<B, Q> for RateLimitStage {
    fn kind(&self) -> StageKind {
        StageKind::RateLimit
    }

    async fn run(&self, exchange: &mut Exchange<'_, B, Q>) -> Result<(), ApiError> {
        let key = self
            .key
            .resolve(exchange.context.client_address(), exchange.context.user_id());

        match self.limiter.check(&key, Instant::now()) {
            Ok(decision) => {
                if decision.remaining == Some(0) {
                    exchange.logger.debug("Rate limit budget exhausted for this window");
                }
                Ok(())
            }
            Err(e) => {
                metrics::record_rate_limited();
                Err(e)
            }
        }
    }
}

/// Parses body and query against the declared schemas.
pub struct ValidateStage<B, Q> {
    body: Option<Schema<B>>,
    query: Option<Schema<Q>>,
}

impl<B: Input, Q: Input> ValidateStage<B, Q> {
    pub fn new(body: Option<Schema<B>>, query: Option<Schema<Q>>) -> Self {
        Self { body, query }
    }
}

#[async_trait]
impl<B: Input, Q: Input> Stage<B, Q> for ValidateStage<B, Q> {
    fn kind(&self) -> StageKind {
        StageKind::Validate
    }

    async fn run(&self, exchange: &mut Exchange<'_, B, Q>) -> Result<(), ApiError> {
        let request = exchange.request;
        match validate(
            Some(request.body.as_ref()),
            request.query(),
            self.body.as_ref(),
            self.query.as_ref(),
        ) {
            Ok(validated) => {
                exchange.body = validated.body;
                exchange.query = validated.query;
                Ok(())
            }
            Err(e) => {
                let reason = match &e {
                    ApiError::Validation {
                        reason: Some(reason),
                        ..
                    } => *reason,
                    _ => "schema",
                };
                metrics::record_validation_failure(reason);
                Err(e)
            }
        }
    }
}
