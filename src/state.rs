//! Shared application state for the demo server.
//!
//! Holds the process-wide collaborators every pipeline is built from:
//!
//! - **Logger**: process defaults plus the optional error forwarder
//! - **Authenticator**: verifier chain assembled from configuration
//! - **Rate Limiter**: one shared key → entry map for all limited routes
//! - **Configuration**: runtime configuration access
//!
//! # Structured Concurrency
//!
//! Background tasks (log forwarding, rate limit eviction) are managed using
//! `tokio_util::task::TaskTracker` and `CancellationToken`. Call `shutdown()`
//! to stop them before application exit.

use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::ConfigError;
use crate::logging::{HttpLogSink, LogForwarder, Logger, process_defaults};
use crate::middleware::auth::{
    Authenticator, ChainVerifier, SignedTokenVerifier, StaticTokenVerifier, TokenVerifier,
};
use crate::middleware::rate_limit::{RateLimiter, limiter_from_config, spawn_eviction};
use crate::pipeline::PipelineEnv;

/// Service name reported in every log entry.
pub const SERVICE_NAME: &str = env!("CARGO_PKG_NAME");

/// Shared application state. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<Config>,
    /// Logger, environment and proxy settings for pipelines
    pub env: PipelineEnv,
    pub authenticator: Authenticator,
    /// `None` when rate limiting is disabled
    pub limiter: Option<Arc<dyn RateLimiter>>,
    /// Timestamp when the application started
    pub started_at: Instant,
    /// Tracks spawned background tasks for graceful shutdown
    task_tracker: TaskTracker,
    /// Cancellation token for signaling background tasks to stop
    cancellation_token: CancellationToken,
}

impl AppState {
    /// Build state from configuration and start background tasks.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the auth, rate limit or log sink settings
    /// cannot be turned into working components.
    pub fn new(config: Config) -> Result<Self, ConfigError> {
        let task_tracker = TaskTracker::new();
        let cancellation_token = CancellationToken::new();

        let forwarder = match &config.log_sink_url {
            Some(url) if config.log_forwarding_enabled() => {
                let sink = HttpLogSink::new(url.clone()).map_err(|e| ConfigError::InvalidValue {
                    name: "LOG_SINK_URL",
                    reason: e.to_string(),
                })?;
                info!(url = %url, "Forwarding error logs to external sink");
                Some(LogForwarder::spawn(
                    Arc::new(sink),
                    config.log_forward_queue,
                    &task_tracker,
                    cancellation_token.clone(),
                ))
            }
            _ => None,
        };

        let logger = Logger::with_forwarder(
            config.min_log_level(),
            process_defaults(config.environment, SERVICE_NAME),
            forwarder,
        );

        let authenticator = build_authenticator(&config)?;

        let limiter = limiter_from_config(&config).map_err(|e| ConfigError::InvalidValue {
            name: "RATE_LIMIT_MAX_REQUESTS",
            reason: e.to_string(),
        })?;
        if let Some(limiter) = &limiter {
            info!(
                max_requests = config.rate_limit_max_requests,
                window_secs = config.rate_limit_window.as_secs(),
                strategy = ?config.rate_limit_strategy,
                "Rate limiting enabled"
            );
            spawn_eviction(
                limiter.clone(),
                config.rate_limit_evict_interval,
                &task_tracker,
                cancellation_token.clone(),
            );
        } else {
            info!("Rate limiting disabled (RATE_LIMIT_MAX_REQUESTS=0)");
        }

        Ok(Self {
            env: PipelineEnv::from_config(&config, logger),
            config: Arc::new(config),
            authenticator,
            limiter,
            started_at: Instant::now(),
            task_tracker,
            cancellation_token,
        })
    }

    /// Gracefully shutdown all background tasks.
    ///
    /// Queued error logs are delivered before the forwarder stops.
    pub async fn shutdown(&self) {
        info!("Initiating graceful shutdown of background tasks");

        self.cancellation_token.cancel();
        self.task_tracker.close();
        self.task_tracker.wait().await;

        info!("All background tasks stopped");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancellation_token.is_cancelled()
    }
}

/// Assemble the verifier chain: signed tokens first, then static tokens.
///
/// With neither configured every credential is rejected.
fn build_authenticator(config: &Config) -> Result<Authenticator, ConfigError> {
    let mut verifiers: Vec<Arc<dyn TokenVerifier>> = Vec::new();

    if let Some(secret) = &config.auth_token_secret {
        verifiers.push(Arc::new(SignedTokenVerifier::new(secret.as_bytes())?));
        debug!("Signed token verification enabled");
    }
    if let Some(tokens) = &config.auth_static_tokens {
        let verifier = StaticTokenVerifier::parse(tokens)?;
        debug!(count = verifier.len(), "Static token verification enabled");
        verifiers.push(Arc::new(verifier));
    }
    if verifiers.is_empty() {
        warn!("No AUTH_TOKEN_SECRET or AUTH_STATIC_TOKENS set; authenticated routes reject every request");
    }

    Ok(Authenticator::new(Arc::new(ChainVerifier::new(verifiers)))
        .with_cookie_name(config.auth_cookie_name.clone()))
}
