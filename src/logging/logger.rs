//! Leveled, contextual logging on top of `tracing`.
//!
//! [`Logger`] is the process-wide handle. It owns the immutable process
//! defaults (environment, version, service) and the optional error
//! forwarder. Each request gets its own [`RequestLogger`] from
//! [`Logger::scope`]: an owned overlay of context fields plus named timers.
//! Overlays are never shared, so concurrent requests cannot see or clear
//! each other's fields.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::sink::{LogEntry, LogForwarder};

/// Fields describing what is currently being processed.
pub type LogContext = BTreeMap<String, Value>;

/// Log severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Fatal => "fatal",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" | "trace" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            "fatal" => Ok(LogLevel::Fatal),
            other => Err(format!("unknown log level '{other}'")),
        }
    }
}

struct LoggerInner {
    min_level: LogLevel,
    defaults: LogContext,
    forwarder: Option<LogForwarder>,
}

/// Process-wide logger handle. Cheap to clone.
#[derive(Clone)]
pub struct Logger {
    inner: Arc<LoggerInner>,
}

impl fmt::Debug for Logger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Logger")
            .field("min_level", &self.inner.min_level)
            .field("defaults", &self.inner.defaults)
            .field("forwarding", &self.inner.forwarder.is_some())
            .finish()
    }
}

impl Logger {
    /// Create a logger with the given minimum level and process defaults.
    pub fn new(min_level: LogLevel, defaults: LogContext) -> Self {
        Self::with_forwarder(min_level, defaults, None)
    }

    /// Create a logger that also forwards `error`/`fatal` entries.
    pub fn with_forwarder(
        min_level: LogLevel,
        defaults: LogContext,
        forwarder: Option<LogForwarder>,
    ) -> Self {
        Self {
            inner: Arc::new(LoggerInner {
                min_level,
                defaults,
                forwarder,
            }),
        }
    }

    pub fn min_level(&self) -> LogLevel {
        self.inner.min_level
    }

    pub fn defaults(&self) -> &LogContext {
        &self.inner.defaults
    }

    pub fn is_enabled(&self, level: LogLevel) -> bool {
        level >= self.inner.min_level
    }

    /// Start a per-request overlay seeded with nothing but the defaults.
    pub fn scope(&self) -> RequestLogger {
        RequestLogger {
            logger: self.clone(),
            overlay: LogContext::new(),
            timers: HashMap::new(),
        }
    }

    /// Log outside of any request, with only the process defaults.
    pub fn log(&self, level: LogLevel, message: &str, extra: Option<&LogContext>) {
        if !self.is_enabled(level) {
            return;
        }
        let mut context = self.inner.defaults.clone();
        if let Some(extra) = extra {
            context.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        self.dispatch(level, message, context);
    }

    fn dispatch(&self, level: LogLevel, message: &str, context: LogContext) {
        emit(level, message, &context);

        if level >= LogLevel::Error
            && let Some(forwarder) = &self.inner.forwarder
        {
            forwarder.forward(LogEntry {
                level,
                message: message.to_string(),
                context,
                timestamp: Utc::now(),
            });
        }
    }
}

/// Per-request logging overlay with named timers.
#[derive(Clone)]
pub struct RequestLogger {
    logger: Logger,
    overlay: LogContext,
    timers: HashMap<String, Instant>,
}

impl fmt::Debug for RequestLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestLogger")
            .field("overlay", &self.overlay)
            .field("timers", &self.timers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl RequestLogger {
    /// Merge fields into the overlay, replacing existing keys.
    pub fn set_context<I, K>(&mut self, partial: I)
    where
        I: IntoIterator<Item = (K, Value)>,
        K: Into<String>,
    {
        self.overlay
            .extend(partial.into_iter().map(|(k, v)| (k.into(), v)));
    }

    /// Set a single overlay field.
    pub fn update_context(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.overlay.insert(key.into(), value.into());
    }

    /// Drop every overlay field except `keys_to_keep`. Process defaults stay.
    pub fn clear_context(&mut self, keys_to_keep: &[&str]) {
        self.overlay.retain(|key, _| keys_to_keep.contains(&key.as_str()));
    }

    /// Active context: process defaults overlaid with request fields.
    pub fn context(&self) -> LogContext {
        let mut merged = self.logger.defaults().clone();
        merged.extend(self.overlay.iter().map(|(k, v)| (k.clone(), v.clone())));
        merged
    }

    pub fn log(&self, level: LogLevel, message: &str, extra: Option<&LogContext>) {
        if !self.logger.is_enabled(level) {
            return;
        }
        let mut context = self.context();
        if let Some(extra) = extra {
            context.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        self.logger.dispatch(level, message, context);
    }

    pub fn debug(&self, message: &str) {
        self.log(LogLevel::Debug, message, None);
    }

    pub fn info(&self, message: &str) {
        self.log(LogLevel::Info, message, None);
    }

    pub fn warn(&self, message: &str) {
        self.log(LogLevel::Warn, message, None);
    }

    pub fn error(&self, message: &str) {
        self.log(LogLevel::Error, message, None);
    }

    pub fn fatal(&self, message: &str) {
        self.log(LogLevel::Fatal, message, None);
    }

    /// Record a monotonic start time under `id`, replacing any earlier one.
    pub fn start_timer(&mut self, id: impl Into<String>) {
        self.timers.insert(id.into(), Instant::now());
    }

    /// Remove the timer and return its elapsed time, without logging.
    pub fn take_timer(&mut self, id: &str) -> Option<Duration> {
        self.timers.remove(id).map(|start| start.elapsed())
    }

    /// Stop the timer and log `message` at info with `durationMs`.
    ///
    /// An unknown `id` logs the message without a duration.
    pub fn end_timer(
        &mut self,
        id: &str,
        message: &str,
        extra: Option<&LogContext>,
    ) -> Option<Duration> {
        let elapsed = self.take_timer(id);
        let mut context = extra.cloned().unwrap_or_default();
        context.insert("timer".to_string(), Value::from(id));
        if let Some(elapsed) = elapsed {
            context.insert("durationMs".to_string(), Value::from(duration_ms(elapsed)));
        }
        self.log(LogLevel::Info, message, Some(&context));
        elapsed
    }
}

/// Milliseconds with microsecond precision.
pub fn duration_ms(elapsed: Duration) -> f64 {
    (elapsed.as_micros() as f64) / 1000.0
}

fn emit(level: LogLevel, message: &str, context: &LogContext) {
    // Serializing a map of JSON values cannot realistically fail; fall back
    // to an empty object rather than dropping the entry.
    let rendered = serde_json::to_string(context).unwrap_or_else(|_| "{}".to_string());

    match level {
        LogLevel::Debug => tracing::debug!(context = %rendered, "{message}"),
        LogLevel::Info => tracing::info!(context = %rendered, "{message}"),
        LogLevel::Warn => tracing::warn!(context = %rendered, "{message}"),
        LogLevel::Error => tracing::error!(context = %rendered, "{message}"),
        LogLevel::Fatal => tracing::error!(fatal = true, context = %rendered, "{message}"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn defaults() -> LogContext {
        LogContext::from([
            ("environment".to_string(), json!("development")),
            ("version".to_string(), json!("0.1.0")),
        ])
    }

    #[test]
    fn test_level_ordering() {
        assert!(LogLevel::Debug < LogLevel::Info);
        assert!(LogLevel::Error < LogLevel::Fatal);
        assert_eq!("WARNING".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_min_level_filtering() {
        let logger = Logger::new(LogLevel::Info, defaults());
        assert!(!logger.is_enabled(LogLevel::Debug));
        assert!(logger.is_enabled(LogLevel::Info));
        assert!(logger.is_enabled(LogLevel::Fatal));
    }

    #[test]
    fn test_overlay_merges_over_defaults() {
        let logger = Logger::new(LogLevel::Debug, defaults());
        let mut scoped = logger.scope();
        scoped.set_context([("requestId", json!("r-1")), ("version", json!("override"))]);
        scoped.update_context("userId", "u-9");

        let ctx = scoped.context();
        assert_eq!(ctx["environment"], "development");
        assert_eq!(ctx["version"], "override");
        assert_eq!(ctx["requestId"], "r-1");
        assert_eq!(ctx["userId"], "u-9");
    }

    #[test]
    fn test_clear_context_keeps_listed_keys_and_defaults() {
        let logger = Logger::new(LogLevel::Debug, defaults());
        let mut scoped = logger.scope();
        scoped.set_context([("requestId", json!("r-1")), ("userId", json!("u-1"))]);

        scoped.clear_context(&["requestId"]);
        let ctx = scoped.context();
        assert_eq!(ctx["requestId"], "r-1");
        assert!(!ctx.contains_key("userId"));
        assert_eq!(ctx["environment"], "development");

        scoped.clear_context(&[]);
        assert_eq!(scoped.context(), defaults());
    }

    #[test]
    fn test_scopes_are_independent() {
        let logger = Logger::new(LogLevel::Debug, defaults());
        let mut first = logger.scope();
        let second = logger.scope();

        first.update_context("requestId", "only-first");
        assert!(!second.context().contains_key("requestId"));
    }

    #[test]
    fn test_timer_round_trip() {
        let logger = Logger::new(LogLevel::Debug, defaults());
        let mut scoped = logger.scope();

        scoped.start_timer("db");
        std::thread::sleep(Duration::from_millis(5));
        let elapsed = scoped.end_timer("db", "query finished", None).unwrap();
        assert!(elapsed >= Duration::from_millis(4));

        // Timer entry is discarded after ending
        assert!(scoped.take_timer("db").is_none());
    }

    #[test]
    fn test_end_timer_without_start_does_not_panic() {
        let logger = Logger::new(LogLevel::Debug, defaults());
        let mut scoped = logger.scope();
        assert!(scoped.end_timer("never-started", "done", None).is_none());
    }

    #[test]
    fn test_duration_ms_precision() {
        assert_eq!(duration_ms(Duration::from_micros(1500)), 1.5);
    }
}
