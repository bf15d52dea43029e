//! Application configuration loaded from environment variables.
//!
//! # Environment
//!
//! `APP_ENV` (`development` | `production`) drives three behaviours:
//!
//! - the minimum log level (`debug` in development, `info` in production)
//! - whether error envelopes carry debug details (development only)
//! - whether error logs are forwarded to the external sink (production only)
//!
//! # Security Configuration
//!
//! - `AUTH_TOKEN_SECRET`: HMAC secret for signed bearer tokens
//! - `AUTH_STATIC_TOKENS`: `token=user_id:email:role` entries separated by `;`
//! - `TRUSTED_PROXIES`: CIDR ranges whose forwarding headers are believed
//!
//! # Rate Limiting
//!
//! - `RATE_LIMIT_MAX_REQUESTS`: requests per window per client (0 = disabled)
//! - `RATE_LIMIT_WINDOW_SECS`: window length
//! - `RATE_LIMIT_STRATEGY`: `fixed_window` (default) or `gcra`

use std::env;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;
use crate::logging::LogLevel;
use crate::middleware::auth::DEFAULT_AUTH_COOKIE;

/// Deployment environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Environment {
    #[default]
    Development,
    Production,
}

impl Environment {
    pub fn is_production(self) -> bool {
        self == Environment::Production
    }

    /// Error envelopes carry trace snippets only outside production.
    pub fn include_debug_details(self) -> bool {
        !self.is_production()
    }

    pub fn default_log_level(self) -> LogLevel {
        match self {
            Environment::Development => LogLevel::Debug,
            Environment::Production => LogLevel::Info,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Environment::Development => "development",
            Environment::Production => "production",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "production" | "prod" => Ok(Environment::Production),
            other => Err(format!("unknown environment '{other}'")),
        }
    }
}

/// Rate limiting algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitStrategy {
    /// Reset-at-boundary counter per client.
    #[default]
    FixedWindow,
    /// Generic cell rate algorithm via `governor`.
    Gcra,
}

impl FromStr for RateLimitStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed_window" | "fixed" => Ok(RateLimitStrategy::FixedWindow),
            "gcra" => Ok(RateLimitStrategy::Gcra),
            other => Err(format!("unknown strategy '{other}'")),
        }
    }
}

/// Application configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    // =========================================================================
    // Server Configuration
    // =========================================================================
    /// Server host address (default: "0.0.0.0")
    pub host: String,

    /// Server port (default: 3000)
    pub port: u16,

    /// Deployment environment (default: development)
    pub environment: Environment,

    /// Maximum request body size in bytes (default: 1MB)
    pub max_request_body_size: usize,

    /// Allowed CORS origins, `*` for any
    pub cors_allowed_origins: Vec<String>,

    // =========================================================================
    // Logging Configuration
    // =========================================================================
    /// Minimum log level; `None` uses the environment default
    pub log_level: Option<LogLevel>,

    /// Endpoint receiving forwarded error logs in production
    pub log_sink_url: Option<String>,

    /// Capacity of the log forwarding queue (default: 1024)
    pub log_forward_queue: usize,

    // =========================================================================
    // Rate Limiting Configuration
    // =========================================================================
    /// Requests allowed per window per client (default: 100, 0 = disabled)
    pub rate_limit_max_requests: u32,

    /// Window length (default: 60s)
    pub rate_limit_window: Duration,

    /// Algorithm (default: fixed window)
    pub rate_limit_strategy: RateLimitStrategy,

    /// Sweep interval for stale entries (default: 300s, zero = no sweeping)
    pub rate_limit_evict_interval: Duration,

    // =========================================================================
    // Security Configuration
    // =========================================================================
    /// HMAC secret for signed bearer tokens
    pub auth_token_secret: Option<String>,

    /// Raw static token table (`token=user_id:email:role;...`)
    pub auth_static_tokens: Option<String>,

    /// Cookie consulted when no Authorization header is present
    pub auth_cookie_name: String,

    /// Trusted proxy CIDR ranges for client address resolution
    pub trusted_proxies: Vec<String>,

    // =========================================================================
    // Observability Configuration
    // =========================================================================
    /// Port for Prometheus metrics endpoint (default: 0 = disabled)
    pub metrics_port: u16,
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable cannot be parsed or the resulting
    /// configuration is inconsistent.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load an .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let config = Self {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: parse_env("PORT", 3000)?,
            environment: parse_env("APP_ENV", Environment::Development)?,
            max_request_body_size: parse_env("MAX_REQUEST_BODY_SIZE", 1024 * 1024)?,
            cors_allowed_origins: parse_list("CORS_ALLOWED_ORIGINS", ',')
                .unwrap_or_else(|| vec!["*".to_string()]),

            log_level: parse_optional_env("LOG_LEVEL")?,
            log_sink_url: non_empty_env("LOG_SINK_URL"),
            log_forward_queue: parse_env("LOG_FORWARD_QUEUE", 1024)?,

            rate_limit_max_requests: parse_env("RATE_LIMIT_MAX_REQUESTS", 100)?,
            rate_limit_window: Duration::from_secs(parse_env("RATE_LIMIT_WINDOW_SECS", 60)?),
            rate_limit_strategy: parse_env("RATE_LIMIT_STRATEGY", RateLimitStrategy::FixedWindow)?,
            rate_limit_evict_interval: Duration::from_secs(parse_env(
                "RATE_LIMIT_EVICT_INTERVAL_SECS",
                300,
            )?),

            auth_token_secret: non_empty_env("AUTH_TOKEN_SECRET"),
            auth_static_tokens: non_empty_env("AUTH_STATIC_TOKENS"),
            auth_cookie_name: env::var("AUTH_COOKIE_NAME")
                .unwrap_or_else(|_| DEFAULT_AUTH_COOKIE.to_string()),
            trusted_proxies: parse_list("TRUSTED_PROXIES", ',').unwrap_or_default(),

            metrics_port: parse_env("METRICS_PORT", 0)?,
        };

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values for consistency and correctness.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rate_limiting_enabled() && self.rate_limit_window.is_zero() {
            return Err(ConfigError::Inconsistent(
                "RATE_LIMIT_WINDOW_SECS must be greater than 0 when rate limiting is enabled"
                    .to_string(),
            ));
        }

        if self.max_request_body_size == 0 {
            return Err(ConfigError::Inconsistent(
                "MAX_REQUEST_BODY_SIZE must be greater than 0".to_string(),
            ));
        }

        if self.log_forward_queue == 0 {
            return Err(ConfigError::Inconsistent(
                "LOG_FORWARD_QUEUE must be greater than 0".to_string(),
            ));
        }

        if self.auth_cookie_name.trim().is_empty() {
            return Err(ConfigError::Inconsistent(
                "AUTH_COOKIE_NAME cannot be empty".to_string(),
            ));
        }

        Ok(())
    }

    /// Get the full server address for binding.
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn rate_limiting_enabled(&self) -> bool {
        self.rate_limit_max_requests > 0
    }

    pub fn auth_enabled(&self) -> bool {
        self.auth_token_secret.is_some() || self.auth_static_tokens.is_some()
    }

    /// Effective minimum log level.
    pub fn min_log_level(&self) -> LogLevel {
        self.log_level
            .unwrap_or_else(|| self.environment.default_log_level())
    }

    /// Log forwarding applies only in production with a sink configured.
    pub fn log_forwarding_enabled(&self) -> bool {
        self.environment.is_production() && self.log_sink_url.is_some()
    }

    pub fn metrics_addr(&self) -> Option<std::net::SocketAddr> {
        (self.metrics_port > 0)
            .then(|| std::net::SocketAddr::from(([0, 0, 0, 0], self.metrics_port)))
    }
}

/// Default configuration for testing and development.
impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            environment: Environment::Development,
            max_request_body_size: 1024 * 1024,
            cors_allowed_origins: vec!["*".to_string()],
            log_level: None,
            log_sink_url: None,
            log_forward_queue: 1024,
            rate_limit_max_requests: 100,
            rate_limit_window: Duration::from_secs(60),
            rate_limit_strategy: RateLimitStrategy::FixedWindow,
            rate_limit_evict_interval: Duration::from_secs(300),
            auth_token_secret: None,
            auth_static_tokens: None,
            auth_cookie_name: DEFAULT_AUTH_COOKIE.to_string(),
            trusted_proxies: vec![],
            metrics_port: 0,
        }
    }
}

/// Parse an environment variable into the specified type with a default value.
fn parse_env<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(name) {
        Ok(val) => val.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            name,
            reason: e.to_string(),
        }),
        Err(_) => Ok(default),
    }
}

fn parse_optional_env<T>(name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    non_empty_env(name)
        .map(|val| {
            val.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                name,
                reason: e.to_string(),
            })
        })
        .transpose()
}

fn non_empty_env(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse_list(name: &str, separator: char) -> Option<Vec<String>> {
    non_empty_env(name).map(|raw| {
        raw.split(separator)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}
