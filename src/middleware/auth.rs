//! Bearer-token authentication.
//!
//! # Credential Sources
//!
//! Checked in order:
//! 1. `Authorization: Bearer <token>` header (preferred)
//! 2. A cookie, `auth_token` by default
//!
//! An `Authorization` header with any other scheme is an invalid credential,
//! not a missing one.
//!
//! # Failure Semantics
//!
//! Missing, malformed, unknown, expired or unverifiable credentials are all
//! Authentication errors (401). Authorization (403) is reserved for a valid
//! identity lacking rights for a specific operation; handlers raise it via
//! [`Identity::require_role`].
//!
//! # Verifiers
//!
//! - [`StaticTokenVerifier`]: fixed token table, constant-time comparison
//! - [`SignedTokenVerifier`]: `base64url(claims).base64url(HMAC-SHA256)` tokens
//! - [`ChainVerifier`]: first verifier that accepts wins

use std::sync::Arc;

use async_trait::async_trait;
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::context::cookie_value;
use crate::error::{ApiError, ConfigError};

/// Default cookie carrying the session token.
pub const DEFAULT_AUTH_COOKIE: &str = "auth_token";

const BEARER_SCHEME: &str = "bearer";

type HmacSha256 = Hmac<Sha256>;

/// Resolved caller identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
    pub role: Option<String>,
}

impl Identity {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            email: None,
            role: None,
        }
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    /// Fail with Authorization unless the caller has `role`.
    pub fn require_role(&self, role: &str) -> Result<(), ApiError> {
        if self.role.as_deref() == Some(role) {
            Ok(())
        } else {
            Err(ApiError::authorization(format!(
                "This operation requires the '{role}' role"
            )))
        }
    }
}

/// A credential found on the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Credential {
    Bearer(String),
    Cookie(String),
    /// Authorization header with a scheme other than Bearer.
    UnsupportedScheme(String),
}

impl Credential {
    pub fn source(&self) -> &'static str {
        match self {
            Credential::Bearer(_) => "header",
            Credential::Cookie(_) => "cookie",
            Credential::UnsupportedScheme(_) => "header",
        }
    }
}

/// Extract the credential from request headers.
pub fn extract_credential(headers: &HeaderMap, cookie_name: &str) -> Option<Credential> {
    if let Some(value) = headers.get(AUTHORIZATION) {
        let Ok(value) = value.to_str() else {
            return Some(Credential::UnsupportedScheme("non-ascii".to_string()));
        };
        return Some(match value.trim().split_once(' ') {
            Some((scheme, token))
                if scheme.eq_ignore_ascii_case(BEARER_SCHEME) && !token.trim().is_empty() =>
            {
                Credential::Bearer(token.trim().to_string())
            }
            Some((scheme, _)) => Credential::UnsupportedScheme(scheme.to_string()),
            None => Credential::UnsupportedScheme(value.trim().to_string()),
        });
    }

    cookie_value(headers, cookie_name)
        .filter(|token| !token.is_empty())
        .map(|token| Credential::Cookie(token.to_string()))
}

/// Resolves a raw token to an identity. May suspend (remote verification).
#[async_trait]
pub trait TokenVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<Identity, ApiError>;
}

/// Extracts the request credential and verifies it.
#[derive(Clone)]
pub struct Authenticator {
    verifier: Arc<dyn TokenVerifier>,
    cookie_name: String,
}

impl Authenticator {
    pub fn new(verifier: Arc<dyn TokenVerifier>) -> Self {
        Self {
            verifier,
            cookie_name: DEFAULT_AUTH_COOKIE.to_string(),
        }
    }

    pub fn with_cookie_name(mut self, cookie_name: impl Into<String>) -> Self {
        self.cookie_name = cookie_name.into();
        self
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub async fn authenticate(&self, headers: &HeaderMap) -> Result<Identity, ApiError> {
        match extract_credential(headers, &self.cookie_name) {
            None => Err(ApiError::authentication("Authentication required")),
            Some(Credential::UnsupportedScheme(scheme)) => {
                debug!(scheme = %scheme, "Unsupported authorization scheme");
                Err(ApiError::authentication(
                    "Unsupported authorization scheme, expected Bearer",
                ))
            }
            Some(Credential::Bearer(token) | Credential::Cookie(token)) => {
                self.verifier.verify(&token).await
            }
        }
    }
}

// =============================================================================
// Static tokens
// =============================================================================

/// Verifies against a fixed token table.
///
/// Every entry is compared so lookup time does not depend on which token
/// matched.
#[derive(Default)]
pub struct StaticTokenVerifier {
    tokens: Vec<(String, Identity)>,
}

impl StaticTokenVerifier {
    pub fn new(tokens: Vec<(String, Identity)>) -> Self {
        Self { tokens }
    }

    /// Parse `token=user_id:email:role` entries separated by `;`.
    /// Email and role may be empty.
    pub fn parse(entries: &str) -> Result<Self, ConfigError> {
        let mut tokens = Vec::new();
        for entry in entries.split(';').map(str::trim).filter(|e| !e.is_empty()) {
            let invalid = |reason: &str| ConfigError::InvalidValue {
                name: "AUTH_STATIC_TOKENS",
                reason: reason.to_string(),
            };
            let (token, identity) = entry
                .split_once('=')
                .ok_or_else(|| invalid("entry must be token=user_id:email:role"))?;
            let mut parts = identity.split(':');
            let user_id = parts
                .next()
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .ok_or_else(|| invalid("user_id cannot be empty"))?;
            if token.trim().is_empty() {
                return Err(invalid("token cannot be empty"));
            }

            let non_empty = |s: Option<&str>| s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string);
            tokens.push((
                token.trim().to_string(),
                Identity {
                    user_id: user_id.to_string(),
                    email: non_empty(parts.next()),
                    role: non_empty(parts.next()),
                },
            ));
        }
        Ok(Self { tokens })
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl TokenVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, ApiError> {
        let mut found = None;
        for (candidate, identity) in &self.tokens {
            if bool::from(candidate.as_bytes().ct_eq(token.as_bytes())) {
                found = Some(identity);
            }
        }
        found
            .cloned()
            .ok_or_else(|| ApiError::authentication("Invalid credential"))
    }
}

// =============================================================================
// Signed tokens
// =============================================================================

/// Claims carried by a signed token. `exp` is a Unix timestamp in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    pub exp: i64,
}

/// HMAC-SHA256 signed tokens: `base64url(claims JSON).base64url(signature)`.
#[derive(Clone)]
pub struct SignedTokenVerifier {
    mac: HmacSha256,
}

impl SignedTokenVerifier {
    pub fn new(secret: &[u8]) -> Result<Self, ConfigError> {
        if secret.is_empty() {
            return Err(ConfigError::InvalidValue {
                name: "AUTH_TOKEN_SECRET",
                reason: "secret cannot be empty".to_string(),
            });
        }
        let mac = HmacSha256::new_from_slice(secret).map_err(|e| ConfigError::InvalidValue {
            name: "AUTH_TOKEN_SECRET",
            reason: e.to_string(),
        })?;
        Ok(Self { mac })
    }

    /// Sign claims into a token.
    pub fn issue(&self, claims: &TokenClaims) -> Result<String, ApiError> {
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims)?);
        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
        Ok(format!("{payload}.{signature}"))
    }

    /// Verify a token against an explicit clock (seconds since epoch).
    pub fn verify_at(&self, token: &str, now: i64) -> Result<Identity, ApiError> {
        let (payload, signature) = token
            .split_once('.')
            .ok_or_else(|| ApiError::authentication("Malformed token"))?;
        let signature = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| ApiError::authentication("Malformed token"))?;

        let mut mac = self.mac.clone();
        mac.update(payload.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| ApiError::authentication("Invalid token signature"))?;

        let claims: TokenClaims = URL_SAFE_NO_PAD
            .decode(payload)
            .ok()
            .and_then(|bytes| serde_json::from_slice(&bytes).ok())
            .ok_or_else(|| ApiError::authentication("Malformed token"))?;

        if claims.exp <= now {
            return Err(ApiError::authentication("Token expired"));
        }

        Ok(Identity {
            user_id: claims.sub,
            email: claims.email,
            role: claims.role,
        })
    }
}

#[async_trait]
impl TokenVerifier for SignedTokenVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, ApiError> {
        self.verify_at(token, Utc::now().timestamp())
    }
}

// =============================================================================
// Chain
// =============================================================================

/// Tries verifiers in order; the first success wins, else the last error.
pub struct ChainVerifier {
    verifiers: Vec<Arc<dyn TokenVerifier>>,
}

impl ChainVerifier {
    pub fn new(verifiers: Vec<Arc<dyn TokenVerifier>>) -> Self {
        Self { verifiers }
    }
}

#[async_trait]
impl TokenVerifier for ChainVerifier {
    async fn verify(&self, token: &str) -> Result<Identity, ApiError> {
        let mut last_error = ApiError::authentication("Invalid credential");
        for verifier in &self.verifiers {
            match verifier.verify(token).await {
                Ok(identity) => return Ok(identity),
                Err(e) => last_error = e,
            }
        }
        Err(last_error)
    }
}
