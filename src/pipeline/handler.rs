//! Business handlers and what they return.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::Value;

use crate::context::{IncomingRequest, RequestContext};
use crate::error::{ApiError, ApiResult};
use crate::logging::RequestLogger;
use crate::middleware::auth::Identity;
use crate::response::{attach_request_id, success_response};

use super::Input;

/// Everything a handler receives once the stages have passed.
pub struct HandlerInput<B, Q> {
    pub request: Arc<IncomingRequest>,
    pub context: RequestContext,
    /// Request-scoped logger carrying the request and identity fields.
    pub logger: RequestLogger,
    pub body: Option<B>,
    pub query: Option<Q>,
}

impl<B, Q> HandlerInput<B, Q> {
    /// The authenticated caller, or Authentication if the pipeline did not
    /// authenticate this request.
    pub fn identity(&self) -> ApiResult<&Identity> {
        self.context
            .identity()
            .ok_or_else(|| ApiError::authentication("Authentication required"))
    }

    /// Validated body. Fails if no body schema was declared.
    pub fn take_body(&mut self) -> ApiResult<B> {
        self.body
            .take()
            .ok_or_else(|| ApiError::internal("handler expected a validated body"))
    }

    /// Validated query. Fails if no query schema was declared.
    pub fn take_query(&mut self) -> ApiResult<Q> {
        self.query
            .take()
            .ok_or_else(|| ApiError::internal("handler expected a validated query"))
    }
}

/// Handler result: a value for the success envelope, or a finished response.
#[derive(Debug)]
pub enum Reply {
    Data { status: StatusCode, data: Value },
    Raw(Response),
}

impl Reply {
    /// Wrap a value in the success envelope with status 200.
    pub fn data(value: impl Serialize) -> ApiResult<Self> {
        Ok(Reply::Data {
            status: StatusCode::OK,
            data: serde_json::to_value(value)?,
        })
    }

    /// Wrap a value in the success envelope with status 201.
    pub fn created(value: impl Serialize) -> ApiResult<Self> {
        Ok(Self::data(value)?.with_status(StatusCode::CREATED))
    }

    /// Pass a pre-built response through unchanged, apart from the request
    /// ID header.
    pub fn raw(response: impl IntoResponse) -> Self {
        Reply::Raw(response.into_response())
    }

    /// Override the status of a data reply. Raw replies keep their own.
    pub fn with_status(self, status: StatusCode) -> Self {
        match self {
            Reply::Data { data, .. } => Reply::Data { status, data },
            raw @ Reply::Raw(_) => raw,
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Reply::Data { status, .. } => *status,
            Reply::Raw(response) => response.status(),
        }
    }

    pub(crate) fn into_response(self, request_id: &str) -> Response {
        match self {
            Reply::Data { status, data } => success_response(status, data, request_id),
            Reply::Raw(mut response) => {
                attach_request_id(&mut response, request_id);
                response
            }
        }
    }
}

#[async_trait]
pub trait Handler<B: Input, Q: Input>: Send + Sync + 'static {
    async fn call(&self, input: HandlerInput<B, Q>) -> ApiResult<Reply>;
}

#[async_trait]
impl<B, Q, F, Fut> Handler<B, Q> for F
where
    B: Input,
    Q: Input,
    F: Fn(HandlerInput<B, Q>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ApiResult<Reply>> + Send + 'static,
{
    async fn call(&self, input: HandlerInput<B, Q>) -> ApiResult<Reply> {
        (self)(input).await
    }
}
