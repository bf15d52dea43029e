//! Shared helpers for integration tests.
#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::fmt;
use std::sync::{Arc, Mutex};

use axum::body::to_bytes;
use axum::response::Response;
use request_pipeline::logging::{LogContext, LogLevel, Logger};
use request_pipeline::middleware::auth::{Authenticator, StaticTokenVerifier};
use request_pipeline::{Environment, PipelineEnv};
use serde_json::Value;
use tracing::field::{Field, Visit};
use tracing::subscriber::DefaultGuard;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::Registry;

pub const ALICE_TOKEN: &str = "alice-token";
pub const BOB_TOKEN: &str = "bob-token";

/// One captured log event.
#[derive(Debug, Clone)]
pub struct Captured {
    pub level: Level,
    pub message: String,
    /// Parsed `context` field, `Null` when absent.
    pub context: Value,
}

/// Collects every event emitted while installed.
///
/// `set_default` is thread-local, so tests using this must run on the
/// current-thread runtime (the `#[tokio::test]` default).
#[derive(Clone, Default)]
pub struct CaptureLayer {
    events: Arc<Mutex<Vec<Captured>>>,
}

impl CaptureLayer {
    pub fn install(&self) -> DefaultGuard {
        tracing::subscriber::set_default(Registry::default().with(self.clone()))
    }

    pub fn events(&self) -> Vec<Captured> {
        self.events.lock().unwrap().clone()
    }

    pub fn with_message(&self, message: &str) -> Vec<Captured> {
        self.events()
            .into_iter()
            .filter(|e| e.message == message)
            .collect()
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    context: Option<String>,
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => self.message = format!("{value:?}"),
            "context" => self.context = Some(format!("{value:?}")),
            _ => {}
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            "context" => self.context = Some(value.to_string()),
            _ => {}
        }
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let context = visitor
            .context
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or(Value::Null);

        self.events.lock().unwrap().push(Captured {
            level: *event.metadata().level(),
            message: visitor.message,
            context,
        });
    }
}

pub fn env(environment: Environment) -> PipelineEnv {
    PipelineEnv::new(Logger::new(LogLevel::Debug, LogContext::new()), environment)
}

pub fn dev_env() -> PipelineEnv {
    env(Environment::Development)
}

/// Two users: alice (admin) and bob (no role).
pub fn authenticator() -> Authenticator {
    let verifier = StaticTokenVerifier::parse(&format!(
        "{ALICE_TOKEN}=u-alice:alice@example.com:admin;{BOB_TOKEN}=u-bob::"
    ))
    .unwrap();
    Authenticator::new(Arc::new(verifier))
}

pub async fn body_json(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
