//! Typed snapshots of one HTTP exchange
//!
//! The middleware captures these at response completion so the filter and
//! formatter work on owned data and never touch live framework objects.

use axum::body::Bytes;
use axum::http::{header, request, HeaderMap, Method, StatusCode, Uri};
use serde_json::Value;
use std::time::Duration;

/// Error attached to a completed exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeError {
    pub message: String,
    pub stack: String,
}

impl ExchangeError {
    pub fn new(message: impl Into<String>, stack: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: stack.into(),
        }
    }

    /// Build from any error, rendering its source chain as the stack
    pub fn from_error<E>(err: &E) -> Self
    where
        E: std::error::Error + ?Sized,
    {
        let mut stack = format!("{:?}", err);
        let mut source = err.source();
        while let Some(cause) = source {
            stack.push_str("\n    caused by: ");
            stack.push_str(&cause.to_string());
            source = cause.source();
        }

        Self {
            message: err.to_string(),
            stack,
        }
    }
}

/// Request side of an exchange
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    /// Parsed JSON body, `None` when absent or not JSON
    pub body: Option<Value>,
    /// Request arrived over TLS (directly or via a terminating proxy)
    pub secure: bool,
}

impl RequestSnapshot {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap) -> Self {
        let secure = is_secure(&uri, &headers);
        Self {
            method,
            uri,
            headers,
            body: None,
            secure,
        }
    }

    pub fn from_parts(parts: &request::Parts, body: &[u8]) -> Self {
        let mut snapshot = Self::new(parts.method.clone(), parts.uri.clone(), parts.headers.clone());
        snapshot.body = parse_json_body(&parts.headers, body);
        snapshot
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }
}

/// Response side of an exchange
#[derive(Debug, Clone)]
pub struct ResponseSnapshot {
    pub status: StatusCode,
    pub headers: HeaderMap,
    /// Raw payload as sent to the client
    pub payload: Option<Bytes>,
}

impl ResponseSnapshot {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }
}

/// A finished request/response pair, ready for filtering and formatting
#[derive(Debug, Clone)]
pub struct CompletedExchange {
    pub request: RequestSnapshot,
    pub response: ResponseSnapshot,
    pub error: Option<ExchangeError>,
    pub elapsed: Option<Duration>,
}

/// Whether the content type header names a JSON media type
pub fn is_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| {
            let ct = ct.to_ascii_lowercase();
            ct.starts_with("application/json") || ct.contains("+json")
        })
        .unwrap_or(false)
}

fn parse_json_body(headers: &HeaderMap, body: &[u8]) -> Option<Value> {
    if body.is_empty() || !is_json_content_type(headers) {
        return None;
    }
    match serde_json::from_slice(body) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::debug!(error = %e, "Request body is not valid JSON, recording as empty");
            None
        }
    }
}

fn is_secure(uri: &Uri, headers: &HeaderMap) -> bool {
    if uri.scheme_str() == Some("https") {
        return true;
    }
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .map(|proto| proto.eq_ignore_ascii_case("https"))
        .unwrap_or(false)
}
