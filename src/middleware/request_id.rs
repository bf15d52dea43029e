//! Request ID resolution for log correlation.
//!
//! A client may supply its own `X-Request-Id`; it is reused when it is
//! non-empty, at most [`MAX_REQUEST_ID_LEN`] characters and made only of
//! visible ASCII. Anything else is replaced with a fresh UUIDv4, so the
//! value is always safe to echo back as a header and to log.
//!
//! ```bash
//! curl -H "X-Request-Id: my-correlation-id" http://localhost:3000/me
//! ```

use axum::http::HeaderMap;
use tracing::debug;
use uuid::Uuid;

/// Header name for request ID.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Longest client-supplied request ID that is accepted.
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// Reuse the client's request ID when acceptable, otherwise generate one.
pub fn resolve_request_id(headers: &HeaderMap) -> String {
    if let Some(value) = headers.get(REQUEST_ID_HEADER)
        && let Ok(value) = value.to_str()
    {
        if is_acceptable(value) {
            return value.to_string();
        }
        debug!(
            len = value.len(),
            "Ignoring unacceptable client request ID, generating a new one"
        );
    }

    Uuid::new_v4().to_string()
}

fn is_acceptable(value: &str) -> bool {
    !value.is_empty()
        && value.len() <= MAX_REQUEST_ID_LEN
        && value.bytes().all(|b| b.is_ascii_graphic())
}
