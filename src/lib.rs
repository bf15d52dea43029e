//! # Request Pipeline
//!
//! A composable request-handling pipeline for Axum services, featuring:
//!
//! - **Request Context**: request IDs, client address, timing and identity
//! - **Security**: bearer/cookie authentication, per-client rate limiting
//! - **Validation**: declarative schemas that report every violation at once
//! - **Uniform Errors**: one typed taxonomy, one JSON envelope
//! - **Observability**: contextual structured logging, one summary line per
//!   request, Prometheus metrics
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Axum HTTP Server                       │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Error boundary (context, request log scope, envelope)      │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Stages (authenticate → rate limit → validate)              │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Handler (typed body/query, identity)                       │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use request_pipeline::pipeline::{HandlerInput, Pipeline, Reply};
//! use request_pipeline::validation::NoInput;
//! use request_pipeline::{AppState, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let state = AppState::new(Config::from_env()?)?;
//!
//!     let hello = Pipeline::builder(state.env.clone())
//!         .authenticate(state.authenticator.clone())
//!         .build(|input: HandlerInput<NoInput, NoInput>| async move {
//!             Reply::data(format!("hello {}", input.identity()?.user_id))
//!         });
//!
//!     let app = axum::Router::<()>::new().route("/hello", axum::routing::get(hello.into_handler()));
//!     // Serve `app` with `into_make_service_with_connect_info::<SocketAddr>()`...
//!     # let _ = app;
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! Enable signed-token authentication and rate limiting:
//! ```bash
//! AUTH_TOKEN_SECRET=change-me RATE_LIMIT_MAX_REQUESTS=100 RATE_LIMIT_WINDOW_SECS=60 cargo run
//! ```

pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod pipeline;
pub mod response;
pub mod routes;
pub mod state;
pub mod utils;
pub mod validation;

// Re-exports for convenience
pub use config::{Config, Environment};
pub use context::{IncomingRequest, RequestContext};
pub use error::{ApiError, ApiResult, ConfigError, ErrorKind};
pub use logging::{LogLevel, Logger, RequestLogger};
pub use pipeline::{Handler, HandlerInput, Pipeline, PipelineEnv, Reply};
pub use routes::build_router;
pub use state::AppState;
pub use validation::{FieldRule, NoInput, Schema};
