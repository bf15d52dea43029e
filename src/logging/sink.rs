//! Fire-and-forget forwarding of error logs to an external sink.
//!
//! [`LogForwarder::forward`] never blocks and never fails: entries go into a
//! bounded queue drained by a background task. A full queue or a failing
//! sink is reported at `debug` through `tracing` only, so a broken sink can
//! never fail a request or recurse into the forwarder.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use super::logger::{LogContext, LogLevel};

/// Timeout for a single delivery to the HTTP sink.
const SINK_TIMEOUT: Duration = Duration::from_secs(5);

/// A log entry as delivered to the sink.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub level: LogLevel,
    pub message: String,
    pub context: LogContext,
    pub timestamp: DateTime<Utc>,
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("sink transport failed: {0}")]
    Transport(String),

    #[error("sink rejected entry with status {0}")]
    Rejected(u16),
}

/// Destination for forwarded log entries.
#[async_trait]
pub trait LogSink: Send + Sync + 'static {
    async fn send(&self, entry: &LogEntry) -> Result<(), SinkError>;
}

/// POSTs each entry as JSON to a collector endpoint.
pub struct HttpLogSink {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpLogSink {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .timeout(SINK_TIMEOUT)
            .build()
            .map_err(|e| SinkError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl LogSink for HttpLogSink {
    async fn send(&self, entry: &LogEntry) -> Result<(), SinkError> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(entry)
            .send()
            .await
            .map_err(|e| SinkError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(SinkError::Rejected(status.as_u16()))
        }
    }
}

/// Handle enqueueing entries for background delivery.
#[derive(Clone)]
pub struct LogForwarder {
    tx: mpsc::Sender<LogEntry>,
}

impl LogForwarder {
    /// Spawn the delivery task on `tracker`; it stops when `token` is
    /// cancelled, after delivering what is already queued.
    pub fn spawn(
        sink: Arc<dyn LogSink>,
        capacity: usize,
        tracker: &TaskTracker,
        token: CancellationToken,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<LogEntry>(capacity.max(1));

        tracker.spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    entry = rx.recv() => match entry {
                        Some(entry) => deliver(sink.as_ref(), &entry).await,
                        None => break,
                    },
                    _ = token.cancelled() => {
                        rx.close();
                        while let Some(entry) = rx.recv().await {
                            deliver(sink.as_ref(), &entry).await;
                        }
                        break;
                    }
                }
            }
            debug!("Log forwarder stopped");
        });

        Self { tx }
    }

    /// Enqueue an entry without waiting. Drops it if the queue is full.
    pub fn forward(&self, entry: LogEntry) {
        if let Err(e) = self.tx.try_send(entry) {
            debug!(reason = %e, "Dropping forwarded log entry");
        }
    }
}

async fn deliver(sink: &dyn LogSink, entry: &LogEntry) {
    if let Err(e) = sink.send(entry).await {
        debug!(error = %e, "Log sink delivery failed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::logging::Logger;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        entries: Mutex<Vec<LogEntry>>,
    }

    #[async_trait]
    impl LogSink for RecordingSink {
        async fn send(&self, entry: &LogEntry) -> Result<(), SinkError> {
            self.entries.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }

    struct FailingSink;

    #[async_trait]
    impl LogSink for FailingSink {
        async fn send(&self, _entry: &LogEntry) -> Result<(), SinkError> {
            Err(SinkError::Rejected(503))
        }
    }

    #[tokio::test]
    async fn test_only_error_and_above_are_forwarded() {
        let sink = Arc::new(RecordingSink::default());
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();
        let forwarder = LogForwarder::spawn(sink.clone(), 16, &tracker, token.clone());

        let logger = Logger::with_forwarder(LogLevel::Debug, LogContext::new(), Some(forwarder));
        let mut scoped = logger.scope();
        scoped.update_context("requestId", "r-42");
        scoped.info("fine");
        scoped.warn("hmm");
        scoped.error("broken");
        scoped.fatal("very broken");

        drop(scoped);
        drop(logger);
        token.cancel();
        tracker.close();
        tracker.wait().await;

        let entries = sink.entries.lock().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, LogLevel::Error);
        assert_eq!(entries[0].context["requestId"], "r-42");
        assert_eq!(entries[1].level, LogLevel::Fatal);
    }

    #[tokio::test]
    async fn test_failing_sink_is_swallowed() {
        let tracker = TaskTracker::new();
        let token = CancellationToken::new();
        let forwarder = LogForwarder::spawn(Arc::new(FailingSink), 4, &tracker, token.clone());

        let logger = Logger::with_forwarder(LogLevel::Debug, LogContext::new(), Some(forwarder));
        logger.log(LogLevel::Error, "will not arrive", None);

        token.cancel();
        tracker.close();
        tracker.wait().await;
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let forwarder = LogForwarder { tx };
        let entry = LogEntry {
            level: LogLevel::Error,
            message: "x".to_string(),
            context: LogContext::new(),
            timestamp: Utc::now(),
        };

        forwarder.forward(entry.clone());
        // Second entry does not fit and is dropped silently
        forwarder.forward(entry);
    }
}
