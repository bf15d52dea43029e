//! Per-request descriptors.
//!
//! [`IncomingRequest`] is the transport-agnostic view of a request the
//! pipeline needs: method, URI, headers, buffered body and peer address.
//! [`RequestContext`] is derived from it once at pipeline entry and threaded
//! explicitly through every stage. Its identity fields never change; only the
//! caller identity is filled in, by the authentication stage.

use std::error::Error as _;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::extract::ConnectInfo;
use axum::http::header::{COOKIE, USER_AGENT};
use axum::http::request::Parts;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::ApiError;
use crate::logging::LogContext;
use crate::middleware::auth::Identity;
use crate::middleware::ip::{TrustedProxies, resolve_client_address};
use crate::middleware::request_id::resolve_request_id;

/// Buffered request as seen by the pipeline.
#[derive(Debug, Clone)]
pub struct IncomingRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub peer: Option<SocketAddr>,
}

impl IncomingRequest {
    pub fn new(method: Method, uri: Uri) -> Self {
        Self {
            method,
            uri,
            headers: HeaderMap::new(),
            body: Bytes::new(),
            peer: None,
        }
    }

    /// Add a header. Invalid names or values are ignored.
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.append(name, value);
        }
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_peer(mut self, peer: SocketAddr) -> Self {
        self.peer = Some(peer);
        self
    }

    /// Buffer an axum request body up to `limit` bytes.
    ///
    /// An oversized or unreadable body is discarded and the error returned
    /// next to the head, so it can still be rendered against this request.
    pub async fn from_parts(parts: Parts, body: Body, limit: usize) -> (Self, Option<ApiError>) {
        let peer = peer_from_parts(&parts);
        let (body, rejected) = match axum::body::to_bytes(body, limit).await {
            Ok(bytes) => (bytes, None),
            Err(err) => (Bytes::new(), Some(body_error(&err, limit))),
        };

        let request = Self {
            method: parts.method,
            uri: parts.uri,
            headers: parts.headers,
            body,
            peer,
        };
        (request, rejected)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// Value of the named cookie, if present.
    pub fn cookie(&self, name: &str) -> Option<&str> {
        cookie_value(&self.headers, name)
    }
}

/// Peer address recorded by `into_make_service_with_connect_info`.
pub fn peer_from_parts(parts: &Parts) -> Option<SocketAddr> {
    parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
}

/// Find a cookie across all `Cookie` headers.
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|header| header.split(';'))
        .find_map(|pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key == name).then_some(value)
        })
}

/// Per-request descriptor threaded through the pipeline.
#[derive(Debug, Clone)]
pub struct RequestContext {
    request_id: String,
    method: Method,
    url: String,
    user_agent: Option<String>,
    client_address: String,
    start_time: Instant,
    started_at: DateTime<Utc>,
    identity: Option<Identity>,
}

impl RequestContext {
    /// Derive the context from request head data.
    pub fn new(
        method: &Method,
        uri: &Uri,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
        proxies: &TrustedProxies,
    ) -> Self {
        let url = uri
            .path_and_query()
            .map_or_else(|| uri.path().to_string(), |pq| pq.as_str().to_string());

        Self {
            request_id: resolve_request_id(headers),
            method: method.clone(),
            url,
            user_agent: headers
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            client_address: resolve_client_address(headers, peer, proxies),
            start_time: Instant::now(),
            started_at: Utc::now(),
            identity: None,
        }
    }

    pub fn for_request(request: &IncomingRequest, proxies: &TrustedProxies) -> Self {
        Self::new(
            &request.method,
            &request.uri,
            &request.headers,
            request.peer,
            proxies,
        )
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn user_agent(&self) -> Option<&str> {
        self.user_agent.as_deref()
    }

    pub fn client_address(&self) -> &str {
        &self.client_address
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn user_id(&self) -> Option<&str> {
        self.identity.as_ref().map(|i| i.user_id.as_str())
    }

    pub fn user_email(&self) -> Option<&str> {
        self.identity.as_ref().and_then(|i| i.email.as_deref())
    }

    pub fn user_role(&self) -> Option<&str> {
        self.identity.as_ref().and_then(|i| i.role.as_deref())
    }

    /// Record the authenticated caller.
    pub fn set_identity(&mut self, identity: Identity) {
        self.identity = Some(identity);
    }

    /// Request fields for the log overlay.
    pub fn log_fields(&self) -> LogContext {
        let mut fields = LogContext::from([
            ("requestId".to_string(), Value::from(self.request_id.as_str())),
            ("method".to_string(), Value::from(self.method.as_str())),
            ("url".to_string(), Value::from(self.url.as_str())),
            (
                "clientAddress".to_string(),
                Value::from(self.client_address.as_str()),
            ),
        ]);
        if let Some(user_agent) = &self.user_agent {
            fields.insert("userAgent".to_string(), Value::from(user_agent.as_str()));
        }
        fields.extend(self.identity_fields());
        fields
    }

    /// Caller identity fields, empty before authentication.
    pub fn identity_fields(&self) -> LogContext {
        let mut fields = LogContext::new();
        if let Some(identity) = &self.identity {
            fields.insert("userId".to_string(), Value::from(identity.user_id.as_str()));
            if let Some(email) = &identity.email {
                fields.insert("userEmail".to_string(), Value::from(email.as_str()));
            }
            if let Some(role) = &identity.role {
                fields.insert("userRole".to_string(), Value::from(role.as_str()));
            }
        }
        fields
    }
}

/// Only the length limit is `body_too_large`; a body that fails mid-read
/// (client disconnect, transport error) is malformed.
fn body_error(err: &axum::Error, limit: usize) -> ApiError {
    let over_limit = err
        .source()
        .is_some_and(|source| source.is::<http_body_util::LengthLimitError>());
    if over_limit {
        ApiError::body_too_large(limit)
    } else {
        ApiError::malformed("Malformed request body")
    }
}
