//! Composition root: one ordered pipeline per endpoint.
//!
//! # Execution Order
//!
//! ```text
//! error boundary → authenticate → rate limit → validate → handler
//!       ↓               ↓              ↓           ↓          ↓
//!  context, logs,     401            429         400      200/201 or
//!  one response                                            typed error
//! ```
//!
//! Stages are held in an explicit list sorted by [`StageKind`], so the order
//! does not depend on builder call order. An unauthenticated request is
//! rejected before it can consume rate-limit budget or trigger validation.
//!
//! # Error Boundary
//!
//! [`Pipeline::handle`] is the only place errors become responses. It builds
//! the [`RequestContext`], opens the request log scope, runs the stages and
//! the handler, renders the envelope and logs exactly one summary line.
//! The handler runs on its own task so a panic becomes an Internal error;
//! dropping the request aborts that task.
//!
//! A pipeline used as another pipeline's handler runs only its stages and
//! handler. It never opens a second boundary, so an error is formatted once.

mod handler;
mod stage;

pub use handler::{Handler, HandlerInput, Reply};
pub use stage::{AuthenticateStage, Exchange, RateLimitStage, Stage, StageKind, ValidateStage};

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use axum::extract::Request;
use axum::response::Response;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::task::AbortOnDropHandle;
use tower::Service;
use validator::Validate;

use crate::config::{Config, Environment};
use crate::context::{IncomingRequest, RequestContext};
use crate::error::{ApiError, ApiResult};
use crate::logging::{LogContext, LogLevel, Logger, RequestLogger, duration_ms};
use crate::metrics;
use crate::middleware::auth::Authenticator;
use crate::middleware::ip::TrustedProxies;
use crate::middleware::rate_limit::{RateLimitKey, RateLimiter};
use crate::response::error_response;
use crate::validation::{NoInput, Schema};

/// Timer covering the whole request.
const REQUEST_TIMER: &str = "request";

/// Bound for parsed body and query types.
pub trait Input: DeserializeOwned + Validate + Send + 'static {}

impl<T> Input for T where T: DeserializeOwned + Validate + Send + 'static {}

/// Process-wide collaborators shared by every pipeline.
#[derive(Debug, Clone)]
pub struct PipelineEnv {
    pub logger: Logger,
    pub environment: Environment,
    pub proxies: Arc<TrustedProxies>,
    pub max_body_size: usize,
}

impl PipelineEnv {
    pub fn new(logger: Logger, environment: Environment) -> Self {
        Self {
            logger,
            environment,
            proxies: Arc::new(TrustedProxies::default()),
            max_body_size: Config::default().max_request_body_size,
        }
    }

    pub fn from_config(config: &Config, logger: Logger) -> Self {
        Self {
            logger,
            environment: config.environment,
            proxies: Arc::new(TrustedProxies::new(&config.trusted_proxies)),
            max_body_size: config.max_request_body_size,
        }
    }

    pub fn with_proxies(mut self, proxies: TrustedProxies) -> Self {
        self.proxies = Arc::new(proxies);
        self
    }

    pub fn with_max_body_size(mut self, max_body_size: usize) -> Self {
        self.max_body_size = max_body_size;
        self
    }
}

/// Collects the optional stages for one endpoint.
///
/// Starts with no input types; declaring a body or query schema fixes the
/// corresponding type.
pub struct PipelineBuilder<B = NoInput, Q = NoInput> {
    env: PipelineEnv,
    authenticate: Option<AuthenticateStage>,
    rate_limit: Option<RateLimitStage>,
    body_schema: Option<Schema<B>>,
    query_schema: Option<Schema<Q>>,
}

impl PipelineBuilder<NoInput, NoInput> {
    pub fn new(env: PipelineEnv) -> Self {
        Self {
            env,
            authenticate: None,
            rate_limit: None,
            body_schema: None,
            query_schema: None,
        }
    }
}

impl<B: Input, Q: Input> PipelineBuilder<B, Q> {
    /// Require a verified caller.
    pub fn authenticate(mut self, authenticator: Authenticator) -> Self {
        self.authenticate = Some(AuthenticateStage::new(authenticator));
        self
    }

    /// Limit requests per client address.
    pub fn rate_limit(self, limiter: Arc<dyn RateLimiter>) -> Self {
        self.rate_limit_by(limiter, RateLimitKey::ClientAddress)
    }

    pub fn rate_limit_by(mut self, limiter: Arc<dyn RateLimiter>, key: RateLimitKey) -> Self {
        self.rate_limit = Some(RateLimitStage::new(limiter, key));
        self
    }

    /// Declare the JSON body schema.
    pub fn validate_body<NB: Input>(self, schema: Schema<NB>) -> PipelineBuilder<NB, Q> {
        PipelineBuilder {
            env: self.env,
            authenticate: self.authenticate,
            rate_limit: self.rate_limit,
            body_schema: Some(schema),
            query_schema: self.query_schema,
        }
    }

    /// Declare the query string schema.
    pub fn validate_query<NQ: Input>(self, schema: Schema<NQ>) -> PipelineBuilder<B, NQ> {
        PipelineBuilder {
            env: self.env,
            authenticate: self.authenticate,
            rate_limit: self.rate_limit,
            body_schema: self.body_schema,
            query_schema: Some(schema),
        }
    }

    /// Wrap `handler` with the collected stages.
    pub fn build(self, handler: impl Handler<B, Q>) -> Pipeline<B, Q> {
        let mut stages: Vec<Box<dyn Stage<B, Q>>> = Vec::new();
        if let Some(stage) = self.rate_limit {
            stages.push(Box::new(stage));
        }
        if self.body_schema.is_some() || self.query_schema.is_some() {
            stages.push(Box::new(ValidateStage::new(
                self.body_schema,
                self.query_schema,
            )));
        }
        if let Some(stage) = self.authenticate {
            stages.push(Box::new(stage));
        }
        stages.sort_by_key(|stage| stage.kind());

        Pipeline {
            inner: Arc::new(PipelineInner {
                env: self.env,
                stages,
                handler: Arc::new(handler),
            }),
        }
    }
}

struct PipelineInner<B, Q> {
    env: PipelineEnv,
    stages: Vec<Box<dyn Stage<B, Q>>>,
    handler: Arc<dyn Handler<B, Q>>,
}

/// A composed endpoint. Cheap to clone.
pub struct Pipeline<B = NoInput, Q = NoInput> {
    inner: Arc<PipelineInner<B, Q>>,
}

impl<B, Q> Clone for Pipeline<B, Q> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl Pipeline<NoInput, NoInput> {
    pub fn builder(env: PipelineEnv) -> PipelineBuilder<NoInput, NoInput> {
        PipelineBuilder::new(env)
    }
}

impl<B: Input, Q: Input> Pipeline<B, Q> {
    /// Stage names in execution order.
    pub fn stage_names(&self) -> Vec<&'static str> {
        self.inner
            .stages
            .iter()
            .map(|stage| stage.kind().name())
            .collect()
    }

    pub fn env(&self) -> &PipelineEnv {
        &self.inner.env
    }

    /// Serve an axum request, buffering the body up to the configured limit.
    pub async fn serve(&self, request: Request) -> Response {
        let (parts, body) = request.into_parts();
        let (incoming, rejected) =
            IncomingRequest::from_parts(parts, body, self.inner.env.max_body_size).await;
        self.boundary(incoming, rejected).await
    }

    /// Run one request through the error boundary.
    pub async fn handle(&self, request: IncomingRequest) -> Response {
        self.boundary(request, None).await
    }

    /// Mount as an axum handler: `get(pipeline.into_handler())`.
    pub fn into_handler(
        self,
    ) -> impl Fn(Request) -> Pin<Box<dyn Future<Output = Response> + Send>>
    + Clone
    + Send
    + Sync
    + 'static {
        move |request: Request| {
            let pipeline = self.clone();
            Box::pin(async move { pipeline.serve(request).await })
        }
    }

    async fn boundary(&self, request: IncomingRequest, rejected: Option<ApiError>) -> Response {
        let env = &self.inner.env;
        let mut context = RequestContext::for_request(&request, &env.proxies);
        let mut logger = env.logger.scope();
        logger.set_context(context.log_fields());
        logger.start_timer(REQUEST_TIMER);
        logger.debug("Request started");

        let result = match rejected {
            Some(error) => Err(error),
            None => self.execute(Arc::new(request), &mut context, &mut logger).await,
        };

        self.close(result, &context, &mut logger)
    }

    async fn execute(
        &self,
        request: Arc<IncomingRequest>,
        context: &mut RequestContext,
        logger: &mut RequestLogger,
    ) -> ApiResult<Reply> {
        let (body, query) = self.run_stages(&request, context, logger).await?;

        let input = HandlerInput {
            request,
            context: context.clone(),
            logger: logger.clone(),
            body,
            query,
        };
        let handler = self.inner.handler.clone();
        let task = AbortOnDropHandle::new(tokio::spawn(async move { handler.call(input).await }));

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(ApiError::from_panic(e.into_panic())),
            Err(e) => Err(ApiError::internal(format!("Handler task failed: {e}"))),
        }
    }

    async fn run_stages(
        &self,
        request: &IncomingRequest,
        context: &mut RequestContext,
        logger: &mut RequestLogger,
    ) -> ApiResult<(Option<B>, Option<Q>)> {
        let mut exchange = Exchange {
            request,
            context,
            logger,
            body: None,
            query: None,
        };
        for stage in &self.inner.stages {
            stage.run(&mut exchange).await?;
        }
        Ok((exchange.body, exchange.query))
    }

    /// Render the outcome, log the summary line and scrub the overlay.
    fn close(
        &self,
        result: ApiResult<Reply>,
        context: &RequestContext,
        logger: &mut RequestLogger,
    ) -> Response {
        let env = &self.inner.env;
        let request_id = context.request_id();

        let (response, error) = match result {
            Ok(reply) => (reply.into_response(request_id), None),
            Err(error) => {
                let response =
                    error_response(&error, request_id, env.environment.include_debug_details());
                (response, Some(error))
            }
        };

        let status = response.status();
        let elapsed = logger
            .take_timer(REQUEST_TIMER)
            .unwrap_or_else(|| context.elapsed());

        let mut fields = LogContext::from([
            ("method".to_string(), Value::from(context.method().as_str())),
            ("url".to_string(), Value::from(context.url())),
            ("statusCode".to_string(), Value::from(status.as_u16())),
            ("durationMs".to_string(), Value::from(duration_ms(elapsed))),
            ("requestId".to_string(), Value::from(request_id)),
        ]);
        fields.extend(context.identity_fields());
        if let Some(error) = &error {
            fields.insert("errorCode".to_string(), Value::from(error.code()));
            fields.insert("error".to_string(), Value::from(error.to_string()));
            if status.is_server_error() {
                fields.insert("errorTrace".to_string(), Value::from(error.trace()));
            }
        }

        let level = if status.is_server_error() {
            LogLevel::Error
        } else if status.is_client_error() || status.is_redirection() {
            LogLevel::Warn
        } else {
            LogLevel::Info
        };
        logger.log(level, "Request completed", Some(&fields));

        metrics::record_request(
            context.method().as_str(),
            status.as_u16(),
            error.as_ref().map_or("OK", ApiError::code),
            elapsed.as_secs_f64(),
        );

        logger.clear_context(&[]);
        response
    }
}

/// Mount with `Router::route_service`. Never fails; errors are rendered as
/// envelopes.
impl<B: Input, Q: Input> Service<Request> for Pipeline<B, Q> {
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let pipeline = self.clone();
        Box::pin(async move { Ok(pipeline.serve(request).await) })
    }
}

/// Nested composition: the inner pipeline's stages run against the outer
/// request context, then its handler. Any error goes to the outer boundary.
///
/// Identity set by an inner authentication stage is visible to the inner
/// handler only; authenticate on the outermost pipeline for it to reach the
/// summary line.
#[async_trait]
impl<B, Q, OB, OQ> Handler<OB, OQ> for Pipeline<B, Q>
where
    B: Input,
    Q: Input,
    OB: Input,
    OQ: Input,
{
    async fn call(&self, input: HandlerInput<OB, OQ>) -> ApiResult<Reply> {
        let HandlerInput {
            request,
            mut context,
            mut logger,
            ..
        } = input;

        let (body, query) = self.run_stages(&request, &mut context, &mut logger).await?;
        self.inner
            .handler
            .call(HandlerInput {
                request,
                context,
                logger,
                body,
                query,
            })
            .await
    }
}
