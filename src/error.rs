//! Closed error taxonomy shared by every pipeline stage and handler.
//!
//! Every failure a request can produce is exactly one [`ApiError`] variant.
//! Each variant maps to a fixed HTTP status and a stable machine-readable
//! code through [`ErrorKind`]. Foreign errors (`anyhow`, boxed std errors,
//! panics) enter the taxonomy only as [`ApiError::Internal`].

use std::any::Any;
use std::fmt;
use std::time::Duration;

use axum::http::StatusCode;
use serde::Serialize;
use serde_json::{Map, Value, json};
use thiserror::Error;

/// Generic message shown to clients in place of internal error details.
pub const GENERIC_INTERNAL_MESSAGE: &str = "An internal error occurred";

/// Discriminant of the taxonomy, carrying the status and code mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    Validation,
    Authentication,
    Authorization,
    NotFound,
    Conflict,
    RateLimit,
    Database,
    ExternalService,
    Internal,
}

impl ErrorKind {
    /// HTTP status code for this kind.
    pub const fn status(self) -> StatusCode {
        match self {
            ErrorKind::Validation => StatusCode::BAD_REQUEST,
            ErrorKind::Authentication => StatusCode::UNAUTHORIZED,
            ErrorKind::Authorization => StatusCode::FORBIDDEN,
            ErrorKind::NotFound => StatusCode::NOT_FOUND,
            ErrorKind::Conflict => StatusCode::CONFLICT,
            ErrorKind::RateLimit => StatusCode::TOO_MANY_REQUESTS,
            ErrorKind::Database => StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::ExternalService => StatusCode::BAD_GATEWAY,
            ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Machine-readable code clients branch on.
    pub const fn code(self) -> &'static str {
        match self {
            ErrorKind::Validation => "VALIDATION_ERROR",
            ErrorKind::Authentication => "AUTHENTICATION_ERROR",
            ErrorKind::Authorization => "AUTHORIZATION_ERROR",
            ErrorKind::NotFound => "NOT_FOUND",
            ErrorKind::Conflict => "CONFLICT_ERROR",
            ErrorKind::RateLimit => "RATE_LIMIT_ERROR",
            ErrorKind::Database => "DATABASE_ERROR",
            ErrorKind::ExternalService => "EXTERNAL_SERVICE_ERROR",
            ErrorKind::Internal => "INTERNAL_SERVER_ERROR",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Where a field violation was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputLocation {
    Body,
    Query,
}

/// A single field-level schema violation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldViolation {
    pub field: String,
    pub location: InputLocation,
    pub message: String,
}

impl FieldViolation {
    pub fn new(
        field: impl Into<String>,
        location: InputLocation,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            location,
            message: message.into(),
        }
    }
}

/// Request-level error. Immutable once constructed.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{message}")]
    Validation {
        message: String,
        errors: Vec<FieldViolation>,
        /// Set for input that could not be parsed at all (`malformed`,
        /// `body_too_large`), as opposed to a schema mismatch.
        reason: Option<&'static str>,
    },

    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    Authorization(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{message}")]
    RateLimit {
        message: String,
        retry_after: Duration,
        limit: u32,
    },

    #[error("{0}")]
    Database(String),

    #[error("{service}: {message}")]
    ExternalService { service: String, message: String },

    #[error("{message}")]
    Internal {
        message: String,
        /// Error chain or panic location, exposed only with debug details.
        trace: Option<String>,
    },
}

impl ApiError {
    /// Schema mismatch listing every violated field.
    pub fn validation(errors: Vec<FieldViolation>) -> Self {
        let message = match errors.len() {
            1 => "Request validation failed: 1 invalid field".to_string(),
            n => format!("Request validation failed: {n} invalid fields"),
        };
        ApiError::Validation {
            message,
            errors,
            reason: None,
        }
    }

    /// Input that could not be parsed as structured data.
    pub fn malformed(message: impl Into<String>) -> Self {
        ApiError::Validation {
            message: message.into(),
            errors: Vec::new(),
            reason: Some("malformed"),
        }
    }

    pub fn body_too_large(limit: usize) -> Self {
        ApiError::Validation {
            message: format!("Request body exceeds the {limit} byte limit"),
            errors: Vec::new(),
            reason: Some("body_too_large"),
        }
    }

    pub fn authentication(message: impl Into<String>) -> Self {
        ApiError::Authentication(message.into())
    }

    pub fn authorization(message: impl Into<String>) -> Self {
        ApiError::Authorization(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        ApiError::NotFound(message.into())
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        ApiError::Conflict(message.into())
    }

    pub fn rate_limited(retry_after: Duration, limit: u32) -> Self {
        ApiError::RateLimit {
            message: "Rate limit exceeded. Please retry later.".to_string(),
            retry_after,
            limit,
        }
    }

    pub fn database(message: impl Into<String>) -> Self {
        ApiError::Database(message.into())
    }

    pub fn external_service(service: impl Into<String>, message: impl Into<String>) -> Self {
        ApiError::ExternalService {
            service: service.into(),
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        ApiError::Internal {
            message: message.into(),
            trace: None,
        }
    }

    /// Convert a panic payload caught at the error boundary.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "handler panicked".to_string());
        ApiError::Internal {
            trace: Some(format!("panic: {message}")),
            message,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Validation { .. } => ErrorKind::Validation,
            ApiError::Authentication(_) => ErrorKind::Authentication,
            ApiError::Authorization(_) => ErrorKind::Authorization,
            ApiError::NotFound(_) => ErrorKind::NotFound,
            ApiError::Conflict(_) => ErrorKind::Conflict,
            ApiError::RateLimit { .. } => ErrorKind::RateLimit,
            ApiError::Database(_) => ErrorKind::Database,
            ApiError::ExternalService { .. } => ErrorKind::ExternalService,
            ApiError::Internal { .. } => ErrorKind::Internal,
        }
    }

    pub fn status(&self) -> StatusCode {
        self.kind().status()
    }

    pub fn code(&self) -> &'static str {
        self.kind().code()
    }

    /// Client-facing structured details, if the variant has any.
    pub fn details(&self) -> Option<Value> {
        match self {
            ApiError::Validation { errors, reason, .. } => {
                let mut details = Map::new();
                if let Some(reason) = reason {
                    details.insert("reason".to_string(), json!(reason));
                }
                if !errors.is_empty() || reason.is_none() {
                    details.insert("errors".to_string(), json!(errors));
                }
                Some(Value::Object(details))
            }
            ApiError::RateLimit {
                retry_after, limit, ..
            } => Some(json!({
                "retryAfterSecs": retry_after_secs(*retry_after),
                "limit": limit,
            })),
            ApiError::ExternalService { service, .. } => Some(json!({ "service": service })),
            _ => None,
        }
    }

    /// Trace snippet attached to the envelope outside production.
    pub fn trace(&self) -> String {
        match self {
            ApiError::Internal {
                trace: Some(trace), ..
            } => trace.clone(),
            other => format!("{other:?}"),
        }
    }
}

/// Whole seconds a client should wait, never less than one.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs.saturating_add(1).max(1)
    } else {
        secs.max(1)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal {
            message: err.to_string(),
            trace: Some(format!("{err:?}")),
        }
    }
}

impl From<Box<dyn std::error::Error + Send + Sync>> for ApiError {
    fn from(err: Box<dyn std::error::Error + Send + Sync>) -> Self {
        ApiError::Internal {
            message: err.to_string(),
            trace: Some(format!("{err:?}")),
        }
    }
}

/// Serializing a handler result failed; client input is never parsed through here.
impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Internal {
            message: format!("Failed to serialize response: {err}"),
            trace: None,
        }
    }
}

/// Convenience type alias for Results with ApiError.
pub type ApiResult<T> = Result<T, ApiError>;

/// Startup configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid {name}: {reason}")]
    InvalidValue { name: &'static str, reason: String },

    #[error("{0}")]
    Inconsistent(String),
}
