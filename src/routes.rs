//! Application routing.
//!
//! Every endpoint is a [`Pipeline`], mounted either as a handler or as a
//! tower service. The pipeline owns request IDs, authentication, rate
//! limiting, validation, the response envelope and the summary log line;
//! the router only adds transport concerns.
//!
//! # Layers (outermost first)
//!
//! ```text
//! Request
//!    │
//!    ▼
//! ┌──────────────────┐
//! │     Tracing      │ ← HTTP request/response spans
//! └────────┬─────────┘
//!          │
//!          ▼
//! ┌──────────────────┐
//! │      CORS        │ ← Cross-origin headers
//! └────────┬─────────┘
//!          │
//!          ▼
//!      Pipeline
//! ```
//!
//! # Routes
//!
//! | Route                 | Stages                          |
//! |-----------------------|---------------------------------|
//! | `GET /health`         | none                            |
//! | `GET /me`             | authenticate                    |
//! | `POST /consultations` | authenticate, rate limit, body  |
//! | `GET /resources`      | rate limit, query               |

use axum::Router;
use axum::routing::{get, get_service, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers::{self, HealthInfo};
use crate::middleware::rate_limit::RateLimitKey;
use crate::models::{CreateConsultationRequest, ResourceQuery};
use crate::pipeline::{HandlerInput, Pipeline, PipelineBuilder};
use crate::state::AppState;
use crate::validation::NoInput;

/// Build the application router with all routes and layers configured.
///
/// Rate limiting is attached only when a limiter is configured; all limited
/// routes share one limiter, so a client's budget spans endpoints.
pub fn build_router(state: AppState) -> Router {
    let config = &state.config;

    let health_info = HealthInfo {
        started_at: state.started_at,
        rate_limiting: state.limiter.is_some(),
        auth_configured: config.auth_enabled(),
    };
    let health = Pipeline::builder(state.env.clone()).build(
        move |_input: HandlerInput<NoInput, NoInput>| handlers::health_check(health_info),
    );

    let me = Pipeline::builder(state.env.clone())
        .authenticate(state.authenticator.clone())
        .build(handlers::me);

    let consultations = with_rate_limit(
        Pipeline::builder(state.env.clone()).authenticate(state.authenticator.clone()),
        &state,
        RateLimitKey::UserOrAddress,
    )
    .validate_body(CreateConsultationRequest::schema())
    .build(handlers::create_consultation);

    let resources = with_rate_limit(
        Pipeline::builder(state.env.clone()),
        &state,
        RateLimitKey::ClientAddress,
    )
    .validate_query(ResourceQuery::schema())
    .build(handlers::list_resources);

    info!(
        max_body_size = config.max_request_body_size,
        environment = config.environment.as_str(),
        "Routes configured"
    );

    Router::new()
        .route("/health", get_service(health))
        .route("/me", get(me.into_handler()))
        .route("/consultations", post(consultations.into_handler()))
        .route("/resources", get(resources.into_handler()))
        .layer(build_cors_layer(&config.cors_allowed_origins))
        .layer(TraceLayer::new_for_http())
}

fn with_rate_limit(
    builder: PipelineBuilder<NoInput, NoInput>,
    state: &AppState,
    key: RateLimitKey,
) -> PipelineBuilder<NoInput, NoInput> {
    match &state.limiter {
        Some(limiter) => builder.rate_limit_by(limiter.clone(), key),
        None => builder,
    }
}

/// Build CORS layer from configuration.
///
/// # Arguments
///
/// * `allowed_origins` - List of allowed origins, or `["*"]` for any origin
///
/// # Security Note
///
/// Using `*` (any origin) is convenient for development but should be
/// avoided in production. Specify explicit origins instead.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let allow_any = allowed_origins.iter().any(|o| o == "*");

    if allow_any {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::Config;
    use axum::body::{Body, to_bytes};
    use axum::http::{Request, StatusCode};
    use serde_json::Value;
    use tower::ServiceExt;

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn test_build_cors_layer_any() {
        let origins = vec!["*".to_string()];
        let _layer = build_cors_layer(&origins);
    }

    #[test]
    fn test_build_cors_layer_specific() {
        let origins = vec![
            "https://example.com".to_string(),
            "https://app.example.com".to_string(),
        ];
        let _layer = build_cors_layer(&origins);
    }

    #[tokio::test]
    async fn test_health_route() {
        let state = AppState::new(Config::default()).unwrap();
        let app = build_router(state.clone());

        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
        let json = body_json(response).await;
        assert_eq!(json["success"], true);
        assert_eq!(json["data"]["status"], "healthy");
        state.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_route_is_404() {
        let state = AppState::new(Config::default()).unwrap();
        let app = build_router(state.clone());

        let response = app
            .oneshot(Request::get("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        state.shutdown().await;
    }
}
