//! Health endpoint.
//!
//! `GET /health` runs through a pipeline with no stages, so it still gets a
//! request ID, the success envelope and a summary log line.

use std::time::Instant;

use tracing::instrument;

use crate::error::ApiResult;
use crate::models::HealthResponse;
use crate::pipeline::Reply;

/// Snapshot of what the health endpoint reports.
#[derive(Debug, Clone, Copy)]
pub struct HealthInfo {
    pub started_at: Instant,
    pub rate_limiting: bool,
    pub auth_configured: bool,
}

/// Health check endpoint.
///
/// Always returns 200 OK.
///
/// # Response Body
///
/// ```json
/// {
///   "success": true,
///   "data": {
///     "status": "healthy",
///     "version": "0.1.0",
///     "uptimeSecs": 42,
///     "rateLimiting": true,
///     "authConfigured": false
///   },
///   "timestamp": "2024-01-15T10:30:00.000Z",
///   "requestId": "..."
/// }
/// ```
#[instrument(skip(info))]
pub async fn health_check(info: HealthInfo) -> ApiResult<Reply> {
    Reply::data(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: info.started_at.elapsed().as_secs(),
        rate_limiting: info.rate_limiting,
        auth_configured: info.auth_configured,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use axum::http::StatusCode;

    #[tokio::test]
    async fn test_health_check_is_ok() {
        let reply = health_check(HealthInfo {
            started_at: Instant::now(),
            rate_limiting: true,
            auth_configured: false,
        })
        .await
        .unwrap();

        assert_eq!(reply.status(), StatusCode::OK);
        match reply {
            Reply::Data { data, .. } => {
                assert_eq!(data["status"], "healthy");
                assert_eq!(data["rateLimiting"], true);
            }
            Reply::Raw(_) => panic!("expected data reply"),
        }
    }
}
