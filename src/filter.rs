//! Event filter: decides whether a log event is recorded

use axum::http::StatusCode;

use crate::exchange::CompletedExchange;
use crate::metrics;

/// A log call as seen by the pipeline
#[derive(Debug, Clone)]
pub enum LogEvent {
    /// Free-form diagnostic line, e.g. a boot message
    Message(String),
    /// A finished HTTP exchange
    Completion(Box<CompletedExchange>),
}

impl LogEvent {
    pub fn completion(exchange: CompletedExchange) -> Self {
        Self::Completion(Box::new(exchange))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message(_) => "message",
            Self::Completion(_) => "completion",
        }
    }
}

impl From<String> for LogEvent {
    fn from(message: String) -> Self {
        Self::Message(message)
    }
}

impl From<&str> for LogEvent {
    fn from(message: &str) -> Self {
        Self::Message(message.to_string())
    }
}

/// Accept/drop policy applied before formatting
#[derive(Debug, Clone)]
pub struct EventFilter {
    suppressed_status: StatusCode,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl EventFilter {
    /// `suppressed_status` is the fault code whose error-less completions are
    /// already reported by the framework and are dropped here.
    pub fn new(suppressed_status: StatusCode) -> Self {
        Self { suppressed_status }
    }

    pub fn suppressed_status(&self) -> StatusCode {
        self.suppressed_status
    }

    /// Return the event if it should be recorded, `None` to drop it.
    ///
    /// Messages always pass. Completions pass when they carry an error, or
    /// when their status is not the suppressed fault code.
    pub fn should_log(&self, event: LogEvent) -> Option<LogEvent> {
        let accepted = match &event {
            LogEvent::Message(_) => true,
            LogEvent::Completion(exchange) => {
                exchange.error.is_some() || exchange.response.status != self.suppressed_status
            }
        };

        if accepted {
            metrics::record_event_accepted(event.kind());
            Some(event)
        } else {
            if let LogEvent::Completion(exchange) = &event {
                metrics::record_event_filtered(exchange.response.status.as_u16());
                tracing::trace!(
                    status = exchange.response.status.as_u16(),
                    path = %exchange.request.uri,
                    "Dropped error-less fault completion"
                );
            }
            None
        }
    }
}
