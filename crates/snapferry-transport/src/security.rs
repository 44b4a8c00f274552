//! Request authentication and response hardening.

use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, HeaderValue, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::protocol::{HEADER_AUTH, QUERY_AUTH};

/// Compares two strings without short-circuiting on the first difference.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes()
        .iter()
        .zip(b.as_bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

/// Shared-token allow-list.
#[derive(Debug, Clone, Default)]
pub struct Authenticator {
    tokens: Vec<String>,
}

impl Authenticator {
    /// Creates an authenticator accepting any of `tokens`.
    pub fn new(tokens: Vec<String>) -> Self {
        let tokens: Vec<String> = tokens.into_iter().filter(|t| !t.is_empty()).collect();
        if tokens.is_empty() {
            warn!("[SECURITY WARNING] replication API is running without authentication, set auth_tokens in config");
        }
        Self { tokens }
    }

    /// Returns true if authentication is switched off.
    pub fn is_open(&self) -> bool {
        self.tokens.is_empty()
    }

    /// Checks a presented token against every allowed one.
    pub fn accepts(&self, presented: Option<&str>) -> bool {
        if self.is_open() {
            return true;
        }
        let Some(presented) = presented else {
            return false;
        };
        // No early exit, every entry is compared.
        self.tokens
            .iter()
            .fold(false, |found, t| constant_time_eq(presented, t) | found)
    }
}

/// Token from the auth header, else from the `authToken` query parameter.
fn presented_token(request: &Request<Body>) -> Option<String> {
    if let Some(value) = request.headers().get(HEADER_AUTH) {
        if let Ok(s) = value.to_str() {
            if !s.is_empty() {
                return Some(s.to_string());
            }
        }
    }
    request.uri().query().and_then(|query| {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == QUERY_AUTH)
            .and_then(|(_, value)| urlencoding::decode(value).ok())
            .map(|value| value.into_owned())
    })
}

/// Rejects unauthenticated requests with 401 before any handler runs.
pub async fn auth_middleware(
    State(auth): State<Arc<Authenticator>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let token = presented_token(&request);
    if !auth.accepts(token.as_deref()) {
        info!(method = %request.method(), uri = %request.uri().path(), "invalid authentication");
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }
    debug!(method = %request.method(), uri = %request.uri().path(), "handling");
    next.run(request).await
}

/// Adds the standard hardening headers to every response.
pub async fn security_headers_middleware(
    request: axum::extract::Request,
    next: axum::middleware::Next,
) -> axum::response::Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    for (name, value) in [
        ("x-content-type-options", "nosniff"),
        ("x-frame-options", "DENY"),
        ("cache-control", "no-store"),
    ] {
        headers.insert(
            HeaderName::from_static(name),
            HeaderValue::from_static(value),
        );
    }
    response
}
