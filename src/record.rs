//! Canonical telemetry record and the formatter that builds it
//!
//! Formatting is a pure transform from a [`CompletedExchange`] snapshot. It
//! never blocks and never mutates its input, so it runs inline on the
//! request-completion path.

use axum::http::{header, HeaderMap};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::correlation::{self, header_str};
use crate::error::TelemetryError;
use crate::exchange::{self, CompletedExchange, ExchangeError, RequestSnapshot, ResponseSnapshot};

/// Normalized, stable-shaped record of one HTTP exchange
///
/// The `*HasBody` / `*HasValue` flags are derived from their companion
/// objects at construction and cannot be set independently.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_timestamp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_timestamp: Option<String>,
    request_body: Value,
    request_has_body: bool,
    pub request_is_secure_transport: bool,
    pub request_content_length: u64,
    pub request_content_type: String,
    request_query_parameters: Map<String, Value>,
    request_query_has_value: bool,
    pub request_headers: BTreeMap<String, String>,
    response_body: Value,
    response_has_body: bool,
    pub request_method: String,
    pub request_path: String,
    pub status_code: u16,
    pub elapsed_millis: u64,
    pub exception_message: String,
    pub exception_stack_trace: String,
}

impl TelemetryRecord {
    pub fn request_body(&self) -> &Value {
        &self.request_body
    }

    pub fn request_has_body(&self) -> bool {
        self.request_has_body
    }

    pub fn request_query_parameters(&self) -> &Map<String, Value> {
        &self.request_query_parameters
    }

    pub fn request_query_has_value(&self) -> bool {
        self.request_query_has_value
    }

    pub fn response_body(&self) -> &Value {
        &self.response_body
    }

    pub fn response_has_body(&self) -> bool {
        self.response_has_body
    }

    fn set_request_body(&mut self, body: Value) {
        self.request_body = body;
        self.request_has_body = !is_empty_body(&self.request_body);
    }

    fn set_request_query(&mut self, query: Map<String, Value>) {
        self.request_query_has_value = !query.is_empty();
        self.request_query_parameters = query;
    }

    fn set_response_body(&mut self, body: Value) {
        self.response_body = body;
        self.response_has_body = !is_empty_body(&self.response_body);
    }
}

/// Build a record from the parts of an exchange.
///
/// Fails only when the response payload claims to be JSON but does not parse;
/// use [`format_lossy`] to record such exchanges with an empty response body.
pub fn format(
    request: &RequestSnapshot,
    response: &ResponseSnapshot,
    error: Option<&ExchangeError>,
    elapsed: Option<Duration>,
) -> Result<TelemetryRecord, TelemetryError> {
    let response_body = parse_response_body(response)?;
    let mut record = base_record(request, response, error, elapsed);
    record.set_response_body(response_body);
    Ok(record)
}

/// Build a record, substituting `{}` for an unparseable response payload
pub fn format_lossy(
    request: &RequestSnapshot,
    response: &ResponseSnapshot,
    error: Option<&ExchangeError>,
    elapsed: Option<Duration>,
) -> TelemetryRecord {
    let mut record = base_record(request, response, error, elapsed);
    if let Ok(body) = parse_response_body(response) {
        record.set_response_body(body);
    }
    record
}

pub fn format_exchange(exchange: &CompletedExchange) -> Result<TelemetryRecord, TelemetryError> {
    format(
        &exchange.request,
        &exchange.response,
        exchange.error.as_ref(),
        exchange.elapsed,
    )
}

pub fn format_exchange_lossy(exchange: &CompletedExchange) -> TelemetryRecord {
    format_lossy(
        &exchange.request,
        &exchange.response,
        exchange.error.as_ref(),
        exchange.elapsed,
    )
}

fn base_record(
    request: &RequestSnapshot,
    response: &ResponseSnapshot,
    error: Option<&ExchangeError>,
    elapsed: Option<Duration>,
) -> TelemetryRecord {
    let headers = &request.headers;

    let mut record = TelemetryRecord {
        conversation_id: header_str(headers, &correlation::CONVERSATION_ID).map(str::to_string),
        request_timestamp: header_str(headers, &correlation::REQUEST_TIMESTAMP).map(str::to_string),
        client_timestamp: header_str(&response.headers, &correlation::CLIENT_TIMESTAMP)
            .map(str::to_string),
        request_body: empty_body(),
        request_has_body: false,
        request_is_secure_transport: request.secure,
        request_content_length: header_str(headers, &header::CONTENT_LENGTH)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(0),
        request_content_type: header_str(headers, &header::CONTENT_TYPE)
            .unwrap_or_default()
            .to_string(),
        request_query_parameters: Map::new(),
        request_query_has_value: false,
        request_headers: header_map_to_strings(headers),
        response_body: empty_body(),
        response_has_body: false,
        request_method: request.method.to_string(),
        request_path: request
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| request.uri.path().to_string()),
        status_code: response.status.as_u16(),
        elapsed_millis: elapsed.map(|d| d.as_millis() as u64).unwrap_or(0),
        exception_message: error.map(|e| e.message.clone()).unwrap_or_default(),
        exception_stack_trace: error.map(|e| e.stack.clone()).unwrap_or_default(),
    };

    record.set_request_body(request.body.clone().map(object_or_empty).unwrap_or_else(empty_body));
    record.set_request_query(parse_query(request.uri.query()));
    record
}

fn parse_response_body(response: &ResponseSnapshot) -> Result<Value, TelemetryError> {
    let payload = match &response.payload {
        Some(payload) if !payload.is_empty() => payload,
        _ => return Ok(empty_body()),
    };

    // Payloads explicitly typed as something other than JSON carry no structure
    let typed = response.headers.contains_key(header::CONTENT_TYPE);
    if typed && !exchange::is_json_content_type(&response.headers) {
        return Ok(empty_body());
    }

    serde_json::from_slice(payload)
        .map(object_or_empty)
        .map_err(TelemetryError::ResponseBody)
}

/// Parse a query string, collecting repeated keys into arrays
pub fn parse_query(query: Option<&str>) -> Map<String, Value> {
    let mut params = Map::new();
    let Some(query) = query else {
        return params;
    };

    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        let value = Value::String(value.into_owned());
        match params.get_mut(&*key) {
            Some(Value::Array(values)) => values.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                params.insert(key.into_owned(), value);
            }
        }
    }
    params
}

fn header_map_to_strings(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut map: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes());
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert_with(|| value.into_owned());
    }
    map
}

fn empty_body() -> Value {
    Value::Object(Map::new())
}

// Scalars and empty containers are recorded as `{}`
fn object_or_empty(value: Value) -> Value {
    if is_empty_body(&value) {
        empty_body()
    } else {
        value
    }
}

fn is_empty_body(value: &Value) -> bool {
    match value {
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => true,
    }
}

/// Process-level fields attached to every line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bindings {
    pub pid: u32,
    pub machine_name: String,
}

impl Bindings {
    pub fn current() -> Self {
        let machine_name = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        Self {
            pid: std::process::id(),
            machine_name,
        }
    }
}

/// What a sink line carries
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum LogPayload {
    Message { msg: String },
    Record(Box<TelemetryRecord>),
}

/// One line handed to the sinks: bindings, level and time around the payload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogLine {
    pub level: &'static str,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub time: DateTime<Utc>,
    pub pid: u32,
    pub machine_name: String,
    #[serde(flatten)]
    pub payload: LogPayload,
}

impl LogLine {
    pub fn message(msg: impl Into<String>, bindings: &Bindings) -> Self {
        Self::message_at("info", msg, bindings)
    }

    pub fn message_at(level: &'static str, msg: impl Into<String>, bindings: &Bindings) -> Self {
        Self::new(level, LogPayload::Message { msg: msg.into() }, bindings)
    }

    pub fn record(record: TelemetryRecord, bindings: &Bindings) -> Self {
        let level = if !record.exception_message.is_empty() || record.status_code >= 500 {
            "error"
        } else {
            "info"
        };
        Self::new(level, LogPayload::Record(Box::new(record)), bindings)
    }

    fn new(level: &'static str, payload: LogPayload, bindings: &Bindings) -> Self {
        Self {
            level,
            time: Utc::now(),
            pid: bindings.pid,
            machine_name: bindings.machine_name.clone(),
            payload,
        }
    }

    /// Calendar date used for index rotation
    pub fn date(&self) -> NaiveDate {
        self.time.date_naive()
    }

    pub fn to_json(&self) -> Result<String, TelemetryError> {
        Ok(serde_json::to_string(self)?)
    }
}
