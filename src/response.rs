//! Uniform response envelope and error formatting.
//!
//! Wire shapes:
//!
//! ```text
//! { "success": true,  "data": <any>, "timestamp": "<ISO8601>", "requestId": "<string>" }
//! { "success": false, "error": {"message", "code", "details"?}, "timestamp", "requestId" }
//! ```
//!
//! Formatting is pure: given the same error, request ID and timestamp it
//! always produces the same envelope, and it never fails.

use axum::Json;
use axum::http::header::{HeaderName, HeaderValue, RETRY_AFTER, WWW_AUTHENTICATE};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{ApiError, GENERIC_INTERNAL_MESSAGE, retry_after_secs};
use crate::middleware::request_id::REQUEST_ID_HEADER;

/// Maximum length of the trace snippet attached with debug details.
const MAX_TRACE_LEN: usize = 2048;

/// Error part of a failed envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub message: String,
    pub code: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Response envelope. Exactly one of `data` and `error` is present.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    pub timestamp: String,
    pub request_id: String,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T, request_id: &str) -> Self {
        Self::success_at(data, request_id, Utc::now())
    }

    pub fn success_at(data: T, request_id: &str, at: DateTime<Utc>) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
            timestamp: iso8601(at),
            request_id: request_id.to_string(),
        }
    }
}

/// Format an error into the failure envelope, stamped now.
pub fn format_error(
    error: &ApiError,
    request_id: &str,
    include_debug_details: bool,
) -> ApiResponse<Value> {
    format_error_at(error, request_id, include_debug_details, Utc::now())
}

/// Format an error into the failure envelope with an explicit timestamp.
///
/// Outside production (`include_debug_details`) a trace snippet is added
/// under `details.trace`. In production an Internal error's message is
/// replaced with [`GENERIC_INTERNAL_MESSAGE`].
pub fn format_error_at(
    error: &ApiError,
    request_id: &str,
    include_debug_details: bool,
    at: DateTime<Utc>,
) -> ApiResponse<Value> {
    let message = match error {
        ApiError::Internal { .. } if !include_debug_details => {
            GENERIC_INTERNAL_MESSAGE.to_string()
        }
        other => other.to_string(),
    };

    let mut details = error.details();
    if include_debug_details {
        let mut trace = error.trace();
        truncate_on_char_boundary(&mut trace, MAX_TRACE_LEN);

        let mut object = match details.take() {
            Some(Value::Object(map)) => map,
            Some(other) => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
            None => Map::new(),
        };
        object.insert("trace".to_string(), Value::String(trace));
        details = Some(Value::Object(object));
    }

    ApiResponse {
        success: false,
        data: None,
        error: Some(ErrorBody {
            message,
            code: error.code(),
            details,
        }),
        timestamp: iso8601(at),
        request_id: request_id.to_string(),
    }
}

/// Render a success envelope as an HTTP response.
pub fn success_response<T: Serialize>(status: StatusCode, data: T, request_id: &str) -> Response {
    let mut response = (status, Json(ApiResponse::success(data, request_id))).into_response();
    attach_request_id(&mut response, request_id);
    response
}

/// Render an error envelope as an HTTP response, with the protocol headers
/// its kind calls for.
pub fn error_response(error: &ApiError, request_id: &str, include_debug_details: bool) -> Response {
    let envelope = format_error(error, request_id, include_debug_details);
    let mut response = (error.status(), Json(envelope)).into_response();
    let headers = response.headers_mut();

    match error {
        ApiError::RateLimit {
            retry_after, limit, ..
        } => {
            headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs(*retry_after)));
            headers.insert(
                HeaderName::from_static("x-ratelimit-limit"),
                HeaderValue::from(*limit),
            );
            headers.insert(
                HeaderName::from_static("x-ratelimit-remaining"),
                HeaderValue::from_static("0"),
            );
        }
        ApiError::Authentication(_) => {
            headers.insert(WWW_AUTHENTICATE, HeaderValue::from_static("Bearer"));
        }
        _ => {}
    }

    attach_request_id(&mut response, request_id);
    response
}

/// Set the `x-request-id` response header. Invalid header text is skipped.
pub fn attach_request_id(response: &mut Response, request_id: &str) {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
}

fn iso8601(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn truncate_on_char_boundary(text: &mut String, max: usize) {
    if text.len() <= max {
        return;
    }
    let mut cut = max;
    while !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text.truncate(cut);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::{FieldViolation, InputLocation};
    use chrono::TimeZone;
    use std::time::Duration;

    fn fixed_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap()
    }

    #[test]
    fn test_success_envelope_shape() {
        let envelope = ApiResponse::success_at(serde_json::json!({"id": 7}), "req-1", fixed_time());
        let json = serde_json::to_value(&envelope).unwrap();

        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["id"], 7);
        assert_eq!(json["requestId"], "req-1");
        assert_eq!(json["timestamp"], "2024-01-15T10:30:00.000Z");
        assert!(json.get("error").is_none());
    }

    #[test]
    fn test_error_envelope_shape() {
        let err = ApiError::not_found("Consultation 12 not found");
        let json = serde_json::to_value(format_error_at(&err, "req-2", false, fixed_time())).unwrap();

        assert_eq!(json["success"], false);
        assert_eq!(json["error"]["code"], "NOT_FOUND");
        assert_eq!(json["error"]["message"], "Consultation 12 not found");
        assert!(json["error"].get("details").is_none());
        assert!(json.get("data").is_none());
    }

    #[test]
    fn test_format_is_idempotent() {
        let err = ApiError::validation(vec![FieldViolation::new(
            "title",
            InputLocation::Body,
            "is required",
        )]);

        let first = serde_json::to_vec(&format_error_at(&err, "req-3", true, fixed_time())).unwrap();
        let second = serde_json::to_vec(&format_error_at(&err, "req-3", true, fixed_time())).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_internal_message_hidden_in_production() {
        let err = ApiError::internal("connection string leaked: postgres://...");

        let prod = format_error(&err, "req-4", false);
        let error = prod.error.unwrap();
        assert_eq!(error.message, GENERIC_INTERNAL_MESSAGE);
        assert!(error.details.is_none());

        let dev = format_error(&err, "req-4", true);
        let error = dev.error.unwrap();
        assert_eq!(error.message, "connection string leaked: postgres://...");
        assert!(error.details.unwrap().get("trace").is_some());
    }

    #[test]
    fn test_debug_trace_merges_into_existing_details() {
        let err = ApiError::rate_limited(Duration::from_secs(12), 5);
        let details = format_error(&err, "req-5", true).error.unwrap().details.unwrap();

        assert_eq!(details["retryAfterSecs"], 12);
        assert_eq!(details["limit"], 5);
        assert!(details["trace"].is_string());
    }

    #[test]
    fn test_trace_is_truncated() {
        let err = ApiError::Internal {
            message: "big".to_string(),
            trace: Some("é".repeat(MAX_TRACE_LEN)),
        };
        let details = format_error(&err, "req-6", true).error.unwrap().details.unwrap();
        assert!(details["trace"].as_str().unwrap().len() <= MAX_TRACE_LEN);
    }

    #[test]
    fn test_rate_limit_response_headers() {
        let err = ApiError::rate_limited(Duration::from_millis(2500), 10);
        let response = error_response(&err, "req-7", false);

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(response.headers()[RETRY_AFTER], "3");
        assert_eq!(response.headers()["x-ratelimit-limit"], "10");
        assert_eq!(response.headers()["x-ratelimit-remaining"], "0");
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-7");
    }

    #[test]
    fn test_authentication_response_challenges() {
        let response = error_response(&ApiError::authentication("Missing credential"), "r", false);
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[WWW_AUTHENTICATE], "Bearer");
    }
}
