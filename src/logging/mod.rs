//! Structured logging: subscriber setup, the contextual logger, and error
//! forwarding to an external sink.

mod logger;
mod sink;

pub use logger::{LogContext, LogLevel, Logger, RequestLogger, duration_ms};
pub use sink::{HttpLogSink, LogEntry, LogForwarder, LogSink, SinkError};

use serde_json::Value;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, Environment};

/// Install the global `tracing` subscriber.
///
/// Development gets human-readable output, production gets JSON lines.
/// `RUST_LOG` still takes precedence for per-target filtering.
pub fn init_tracing(config: &Config) {
    let default_directive = match config.min_log_level() {
        LogLevel::Debug => "debug",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Error | LogLevel::Fatal => "error",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directive));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);

    let result = match config.environment {
        Environment::Development => builder.with_thread_ids(true).try_init(),
        Environment::Production => builder.json().flatten_event(true).try_init(),
    };

    // A subscriber may already be installed (tests, embedding apps).
    if let Err(e) = result {
        tracing::debug!(error = %e, "Tracing subscriber already installed");
    }
}

/// Process-wide default context, set once at startup.
pub fn process_defaults(environment: Environment, service: &str) -> LogContext {
    LogContext::from([
        (
            "environment".to_string(),
            Value::from(environment.as_str()),
        ),
        (
            "version".to_string(),
            Value::from(env!("CARGO_PKG_VERSION")),
        ),
        ("service".to_string(), Value::from(service)),
    ])
}
