use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

use crate::exchange::ExchangeError;

/// Application error types surfaced to HTTP clients
#[derive(Debug)]
pub enum AppError {
    /// Configuration error
    ConfigError(String),
    /// Malformed client input
    BadRequest(String),
    /// Route or resource not found
    NotFound(String),
    /// Memoized load failed
    Cache(CacheError),
    /// Internal server error
    InternalError(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            Self::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            Self::NotFound(msg) => write!(f, "Not found: {}", msg),
            Self::Cache(err) => write!(f, "Cache error: {}", err),
            Self::InternalError(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cache(err) => Some(err),
            _ => None,
        }
    }
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Cache(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            Self::ConfigError(msg)
            | Self::BadRequest(msg)
            | Self::NotFound(msg)
            | Self::InternalError(msg) => msg.clone(),
            Self::Cache(err) => err.to_string(),
        };

        // Carried on the response so the telemetry middleware can record it
        let exchange_error = ExchangeError::from_error(&self);

        let body = Json(json!({
            "statusCode": status.as_u16(),
            "error": status.canonical_reason().unwrap_or("Unknown"),
            "message": message,
        }));

        let mut response = (status, body).into_response();
        response.extensions_mut().insert(exchange_error);
        response
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        Self::InternalError(format!("{:#}", err))
    }
}

impl From<CacheError> for AppError {
    fn from(err: CacheError) -> Self {
        Self::Cache(err)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

/// Faults inside the telemetry pipeline. None of these reach request handlers.
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("response payload is not valid JSON: {0}")]
    ResponseBody(#[source] serde_json::Error),

    #[error("failed to serialize log line: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write to local stream: {0}")]
    Stream(#[from] std::io::Error),

    #[error("remote store request failed: {0}")]
    RemoteTransport(#[from] reqwest::Error),

    #[error("remote store rejected batch ({status}): {message}")]
    RemoteRejected { status: u16, message: String },

    #[error("remote sink queue is full")]
    QueueFull,

    #[error("remote sink queue is closed")]
    QueueClosed,
}

/// Failure of a cache producer, shared by every caller awaiting that attempt
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("producer for key `{key}` failed: {message}")]
    ProducerFailed { key: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = AppError::NotFound("/missing".to_string());
        assert_eq!(error.to_string(), "Not found: /missing");
    }

    #[test]
    fn test_cache_error_display() {
        let error = CacheError::ProducerFailed {
            key: "translations".to_string(),
            message: "file not found".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "producer for key `translations` failed: file not found"
        );
    }

    #[tokio::test]
    async fn test_error_response_carries_exchange_error() {
        let error = AppError::InternalError("Voluntary error".to_string());
        let response = error.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let attached = response.extensions().get::<ExchangeError>().unwrap();
        assert_eq!(attached.message, "Internal error: Voluntary error");
        assert!(!attached.stack.is_empty());
    }

    #[tokio::test]
    async fn test_error_response_body_shape() {
        let response = AppError::BadRequest("param1 is required".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["statusCode"], 400);
        assert_eq!(body["error"], "Bad Request");
        assert_eq!(body["message"], "param1 is required");
    }
}
