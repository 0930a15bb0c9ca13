//! Telemetry pipeline: filter → formatter → sinks, wired into the request
//! lifecycle.
//!
//! The middleware snapshots each exchange, stamps correlation headers on the
//! response and hands the completion to [`Telemetry::log`]. Nothing here can
//! change a response's status or body, and no per-request state outlives the
//! call.

use axum::{
    body::{Body, BodyDataStream, Bytes, HttpBody},
    extract::{Request, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::Response,
};
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::{layer::Context, registry::LookupSpan, Layer};

use crate::config::Config;
use crate::correlation;
use crate::error::TelemetryError;
use crate::exchange::{CompletedExchange, ExchangeError, RequestSnapshot, ResponseSnapshot};
use crate::filter::{EventFilter, LogEvent};
use crate::record::{self, Bindings, LogLine};
use crate::sink::SinkSet;

/// Tracing target whose events are forwarded into the pipeline
pub const TELEMETRY_TARGET: &str = "telemetry";

/// The assembled pipeline, shared by the middleware and the tracing layer
pub struct Telemetry {
    filter: EventFilter,
    sinks: SinkSet,
    bindings: Bindings,
    unrestricted_routes: Vec<String>,
    max_body_bytes: usize,
}

impl Telemetry {
    pub fn new(filter: EventFilter, sinks: SinkSet, bindings: Bindings) -> Self {
        Self {
            filter,
            sinks,
            bindings,
            unrestricted_routes: Vec::new(),
            max_body_bytes: 1024 * 1024,
        }
    }

    pub fn with_unrestricted_routes(mut self, routes: Vec<String>) -> Self {
        self.unrestricted_routes = routes;
        self
    }

    pub fn with_max_body_bytes(mut self, max_body_bytes: usize) -> Self {
        self.max_body_bytes = max_body_bytes;
        self
    }

    /// Build from configuration. Spawns the remote writer when one is configured.
    pub fn from_config(config: &Config) -> Result<(Self, Option<JoinHandle<()>>), TelemetryError> {
        let (sinks, handle) =
            SinkSet::configure(config.resolved_remote(), config.telemetry.queue_capacity)?;
        let suppressed = StatusCode::from_u16(config.telemetry.suppressed_status)
            .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let telemetry = Self::new(EventFilter::new(suppressed), sinks, Bindings::current())
            .with_unrestricted_routes(config.plugin.all_unrestricted_routes())
            .with_max_body_bytes(config.telemetry.max_body_bytes);

        Ok((telemetry, handle))
    }

    pub fn sinks(&self) -> &SinkSet {
        &self.sinks
    }

    /// Run one event through the pipeline. Never fails and never waits on
    /// I/O.
    pub fn log(&self, event: LogEvent) {
        self.log_at("info", event);
    }

    /// Same as [`Telemetry::log`], writing plain messages at `level`.
    /// Completions take their level from the record.
    pub fn log_at(&self, level: &'static str, event: LogEvent) {
        let Some(event) = self.filter.should_log(event) else {
            return;
        };

        let line = match event {
            LogEvent::Message(msg) => LogLine::message_at(level, msg, &self.bindings),
            LogEvent::Completion(exchange) => {
                let record = match record::format_exchange(&exchange) {
                    Ok(record) => record,
                    Err(e) => {
                        tracing::warn!(
                            error = %e,
                            path = %exchange.request.uri,
                            "Unparseable response payload, recording empty body"
                        );
                        record::format_exchange_lossy(&exchange)
                    }
                };
                LogLine::record(record, &self.bindings)
            }
        };

        self.sinks.emit(&line);
    }

    pub fn info(&self, message: impl Into<String>) {
        self.log(LogEvent::Message(message.into()));
    }

    /// Whether correlation stamping is skipped for this path
    pub fn is_unrestricted(&self, path: &str) -> bool {
        self.unrestricted_routes
            .iter()
            .any(|route| path.contains(route.as_str()))
    }

    /// Final flush of every sink, each bounded by `timeout`. Background
    /// writers exit afterwards; later events are dropped.
    pub async fn shutdown(&self, timeout: Duration) {
        tracing::info!("Flushing telemetry sinks");
        self.sinks.close(timeout).await;
    }
}

/// Axum middleware recording every exchange
///
/// Small request bodies are read ahead so the record can carry them. A body
/// that fails or overruns while being read is handed to the handler exactly
/// as far as it got, error included. Small response bodies are copied while
/// the client consumes them; the record is emitted once the body ends or is
/// dropped.
pub async fn telemetry_middleware(
    State(telemetry): State<Arc<Telemetry>>,
    req: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let limit = telemetry.max_body_bytes;

    let (parts, body) = req.into_parts();
    let (captured, body) = if declared_len_within(&parts.headers, limit) {
        read_ahead(body, limit).await
    } else {
        (None, body)
    };
    let snapshot = RequestSnapshot::from_parts(&parts, captured.as_deref().unwrap_or_default());

    let response = next.run(Request::from_parts(parts, body)).await;
    let elapsed = started.elapsed();

    let (mut parts, body) = response.into_parts();
    if !telemetry.is_unrestricted(snapshot.uri.path()) {
        correlation::ensure_correlation(&snapshot.headers, &mut parts.headers);
    }

    let mut response_snapshot = ResponseSnapshot::new(parts.status);
    response_snapshot.headers = parts.headers.clone();

    let exchange = CompletedExchange {
        request: snapshot,
        response: response_snapshot,
        error: parts.extensions.get::<ExchangeError>().cloned(),
        elapsed: Some(elapsed),
    };

    let exact_len = body.size_hint().exact().filter(|len| *len > 0 && *len <= limit as u64);
    let Some(len) = exact_len else {
        telemetry.log(LogEvent::completion(exchange));
        return Response::from_parts(parts, body);
    };

    // The tapped body no longer reports its size, so keep the framing explicit
    if !parts.headers.contains_key(header::CONTENT_LENGTH) {
        parts.headers.insert(header::CONTENT_LENGTH, HeaderValue::from(len));
    }

    let tap = ResponseTap {
        telemetry,
        exchange: Some(exchange),
        captured: Vec::with_capacity(len as usize),
        limit,
        intact: true,
    };
    Response::from_parts(parts, tap.wrap(body))
}

// Only bodies with a known, small length are read ahead; streams pass through
fn declared_len_within(headers: &HeaderMap, limit: usize) -> bool {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<usize>().ok())
        .map(|len| len > 0 && len <= limit)
        .unwrap_or(false)
}

/// Buffer a request body of at most `limit` bytes. On a read error or an
/// overrun the body is rebuilt from what was read plus the rest of the stream.
async fn read_ahead(body: Body, limit: usize) -> (Option<Bytes>, Body) {
    let mut data = body.into_data_stream();
    let mut chunks: Vec<Bytes> = Vec::new();
    let mut read = 0usize;

    while let Some(item) = data.next().await {
        match item {
            Ok(chunk) => {
                read += chunk.len();
                chunks.push(chunk);
                if read > limit {
                    return (None, replay(chunks, None, data));
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "Request body failed during capture, passing it on");
                return (None, replay(chunks, Some(e), data));
            }
        }
    }

    let mut buffer = Vec::with_capacity(read);
    for chunk in &chunks {
        buffer.extend_from_slice(chunk);
    }
    let bytes = Bytes::from(buffer);
    (Some(bytes.clone()), Body::from(bytes))
}

fn replay(chunks: Vec<Bytes>, error: Option<axum::Error>, rest: BodyDataStream) -> Body {
    let read = stream::iter(chunks.into_iter().map(Ok));
    let failed = stream::iter(error.map(Err));
    Body::from_stream(read.chain(failed).chain(rest))
}

/// Copies a response body on its way to the client and records the exchange
/// when the body ends or is dropped
struct ResponseTap {
    telemetry: Arc<Telemetry>,
    exchange: Option<CompletedExchange>,
    captured: Vec<u8>,
    limit: usize,
    /// False once a chunk failed or the body outgrew `limit`
    intact: bool,
}

impl ResponseTap {
    fn wrap(self, body: Body) -> Body {
        let tapped = stream::unfold(
            (body.into_data_stream(), self),
            |(mut inner, mut tap)| async move {
                match inner.next().await {
                    Some(Ok(chunk)) => {
                        tap.observe(&chunk);
                        Some((Ok(chunk), (inner, tap)))
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Response body failed while streaming");
                        tap.intact = false;
                        Some((Err(e), (inner, tap)))
                    }
                    None => {
                        tap.finish(true);
                        None
                    }
                }
            },
        );
        Body::from_stream(tapped)
    }

    fn observe(&mut self, chunk: &Bytes) {
        if self.captured.len() + chunk.len() > self.limit {
            self.intact = false;
        }
        if self.intact {
            self.captured.extend_from_slice(chunk);
        }
    }

    // Payload is attached only for a body that reached its end intact
    fn finish(&mut self, completed: bool) {
        let Some(mut exchange) = self.exchange.take() else {
            return;
        };
        if completed && self.intact {
            exchange.response.payload = Some(Bytes::from(std::mem::take(&mut self.captured)));
        }
        self.telemetry.log(LogEvent::completion(exchange));
    }
}

impl Drop for ResponseTap {
    fn drop(&mut self) {
        self.finish(false);
    }
}

/// Tracing layer forwarding `target: "telemetry"` events as plain messages
pub struct TelemetryLayer {
    telemetry: Arc<Telemetry>,
}

impl TelemetryLayer {
    pub fn new(telemetry: Arc<Telemetry>) -> Self {
        Self { telemetry }
    }
}

impl<S> Layer<S> for TelemetryLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if event.metadata().target() != TELEMETRY_TARGET {
            return;
        }

        struct MessageVisitor {
            message: Option<String>,
        }

        impl tracing::field::Visit for MessageVisitor {
            fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
                // `fmt::Arguments` renders the same through Debug and Display
                if field.name() == "message" {
                    self.message = Some(format!("{:?}", value));
                }
            }

            fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
                if field.name() == "message" {
                    self.message = Some(value.to_string());
                }
            }
        }

        let mut visitor = MessageVisitor { message: None };
        event.record(&mut visitor);

        if let Some(message) = visitor.message {
            let level = level_name(event.metadata().level());
            self.telemetry.log_at(level, LogEvent::Message(message));
        }
    }
}

fn level_name(level: &Level) -> &'static str {
    if *level == Level::ERROR {
        "error"
    } else if *level == Level::WARN {
        "warn"
    } else if *level == Level::DEBUG {
        "debug"
    } else if *level == Level::TRACE {
        "trace"
    } else {
        "info"
    }
}
