//! Trace records: one request's full lifetime plus its nested sub-events.
//!
//! A [`RequestTrace`] is created by the middleware before the downstream
//! handler runs, mutated through a [`TraceHandle`] while the request is in
//! flight, and frozen into an `Arc<RequestTrace>` when it is recorded. After
//! recording it is never mutated again and may be shared freely.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Serialize, Serializer};

/// Alert severity, ordered from least to most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        }
    }
}

/// An immutable annotation emitted when an alert rule fires on a trace.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    /// Unique alert identifier.
    pub id: String,
    /// Rule that fired: `n_plus_one`, `slow_query`, `slow_route`,
    /// `high_error_rate`, `memory_spike`, or `panic`.
    pub kind: String,
    /// Human-readable description.
    pub message: String,
    pub severity: Severity,
    /// Matched route pattern of the originating request.
    pub route_pattern: String,
    /// Trace id of the originating request.
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
    /// Rule-specific key/value details.
    pub details: serde_json::Map<String, serde_json::Value>,
}

/// One database query observed during a request.
#[derive(Debug, Clone, Serialize)]
pub struct DbQuery {
    pub query: String,
    #[serde(serialize_with = "ser_duration_ms", rename = "duration_ms")]
    pub duration: Duration,
    pub rows_affected: i64,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl DbQuery {
    pub fn new(query: impl Into<String>, duration: Duration) -> Self {
        Self {
            query: query.into(),
            duration,
            rows_affected: 0,
            error: None,
            timestamp: Utc::now(),
        }
    }
}

/// One outbound HTTP call observed during a request.
#[derive(Debug, Clone, Serialize)]
pub struct ExternalCall {
    pub url: String,
    pub method: String,
    pub status_code: u16,
    #[serde(serialize_with = "ser_duration_ms", rename = "duration_ms")]
    pub duration: Duration,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ExternalCall {
    pub fn new(method: impl Into<String>, url: impl Into<String>, duration: Duration) -> Self {
        Self {
            url: url.into(),
            method: method.into(),
            status_code: 0,
            duration,
            error: None,
            timestamp: Utc::now(),
        }
    }
}

/// One key-value store command observed during a request.
#[derive(Debug, Clone, Serialize)]
pub struct RedisOp {
    pub command: String,
    pub key: String,
    #[serde(serialize_with = "ser_duration_ms", rename = "duration_ms")]
    pub duration: Duration,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl RedisOp {
    pub fn new(command: impl Into<String>, key: impl Into<String>, duration: Duration) -> Self {
        Self {
            command: command.into(),
            key: key.into(),
            duration,
            error: None,
            timestamp: Utc::now(),
        }
    }
}

/// One document-store operation observed during a request.
#[derive(Debug, Clone, Serialize)]
pub struct MongoOp {
    pub collection: String,
    pub operation: String,
    pub filter: String,
    #[serde(serialize_with = "ser_duration_ms", rename = "duration_ms")]
    pub duration: Duration,
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl MongoOp {
    pub fn new(
        operation: impl Into<String>,
        collection: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self {
            collection: collection.into(),
            operation: operation.into(),
            filter: String::new(),
            duration,
            error: None,
            timestamp: Utc::now(),
        }
    }
}

/// The full record of one request's processing.
#[derive(Debug, Clone, Serialize)]
pub struct RequestTrace {
    /// Opaque 128-bit random id, hex-encoded.
    pub id: String,
    pub method: String,
    /// Raw request path as received.
    pub path: String,
    /// Matched route pattern, when the router resolved one.
    pub route_pattern: String,
    pub query_params: String,
    pub request_headers: HashMap<String, String>,
    #[serde(serialize_with = "ser_body")]
    pub request_body: Option<Bytes>,
    pub response_status: u16,
    pub response_headers: HashMap<String, String>,
    #[serde(serialize_with = "ser_body")]
    pub response_body: Option<Bytes>,
    pub request_size: i64,
    pub response_size: i64,
    pub client_ip: String,
    pub user_agent: String,

    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    #[serde(serialize_with = "ser_duration_ms", rename = "latency_ms")]
    pub latency: Duration,
    #[serde(serialize_with = "ser_duration_ms", rename = "ttfb_ms")]
    pub ttfb: Duration,
    #[serde(serialize_with = "ser_duration_ms", rename = "handler_time_ms")]
    pub handler_time: Duration,

    /// Live tokio tasks at pipeline entry (0 outside a runtime).
    pub tasks_before: usize,
    pub tasks_after: usize,
    /// Cumulative allocation counter at entry (0 unless the host installed
    /// the tracking allocator).
    pub mem_alloc_before: u64,
    pub mem_alloc_after: u64,

    pub db_queries: Vec<DbQuery>,
    #[serde(serialize_with = "ser_duration_ms", rename = "total_db_time_ms")]
    pub total_db_time: Duration,
    pub external_calls: Vec<ExternalCall>,
    #[serde(serialize_with = "ser_duration_ms", rename = "total_ext_time_ms")]
    pub total_ext_time: Duration,
    pub redis_ops: Vec<RedisOp>,
    #[serde(serialize_with = "ser_duration_ms", rename = "total_redis_time_ms")]
    pub total_redis_time: Duration,
    pub mongo_ops: Vec<MongoOp>,
    #[serde(serialize_with = "ser_duration_ms", rename = "total_mongo_time_ms")]
    pub total_mongo_time: Duration,

    pub panicked: bool,
    /// Rendered panic payload, when the handler panicked.
    pub panic_value: Option<String>,
    /// Call-stack snapshot captured at recovery, truncated to 4 KiB.
    pub panic_stack: String,

    pub alerts: Vec<Alert>,
}

impl RequestTrace {
    /// Creates an empty trace for the given request line. All capture fields
    /// start blank; the middleware fills them in.
    pub fn new(id: impl Into<String>, method: impl Into<String>, path: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            method: method.into(),
            path: path.into(),
            route_pattern: String::new(),
            query_params: String::new(),
            request_headers: HashMap::new(),
            request_body: None,
            response_status: 0,
            response_headers: HashMap::new(),
            response_body: None,
            request_size: 0,
            response_size: 0,
            client_ip: String::new(),
            user_agent: String::new(),
            started_at: now,
            ended_at: now,
            latency: Duration::ZERO,
            ttfb: Duration::ZERO,
            handler_time: Duration::ZERO,
            tasks_before: 0,
            tasks_after: 0,
            mem_alloc_before: 0,
            mem_alloc_after: 0,
            db_queries: Vec::new(),
            total_db_time: Duration::ZERO,
            external_calls: Vec::new(),
            total_ext_time: Duration::ZERO,
            redis_ops: Vec::new(),
            total_redis_time: Duration::ZERO,
            mongo_ops: Vec::new(),
            total_mongo_time: Duration::ZERO,
            panicked: false,
            panic_value: None,
            panic_stack: String::new(),
            alerts: Vec::new(),
        }
    }
}

/// Shared handle to the in-flight trace of one request.
///
/// The handler borrows the trace through this handle (via the context
/// carrier) for the duration of the request; the middleware takes the trace
/// out at finalisation, after which every accessor is a no-op.
#[derive(Debug)]
pub struct TraceHandle {
    inner: Mutex<Option<RequestTrace>>,
}

impl TraceHandle {
    pub(crate) fn new(trace: RequestTrace) -> Self {
        Self {
            inner: Mutex::new(Some(trace)),
        }
    }

    /// Runs `f` against the live trace. Returns `None` once the trace has
    /// been finalised (or if the lock is poisoned).
    pub fn with<R>(&self, f: impl FnOnce(&mut RequestTrace) -> R) -> Option<R> {
        let Ok(mut guard) = self.inner.lock() else {
            return None;
        };
        guard.as_mut().map(f)
    }

    /// Takes the trace out for finalisation. Subsequent calls return `None`,
    /// which makes double finalisation (end-of-stream racing drop) harmless.
    pub(crate) fn take(&self) -> Option<RequestTrace> {
        let Ok(mut guard) = self.inner.lock() else {
            return None;
        };
        guard.take()
    }

    /// The trace id, if the trace is still live.
    pub fn id(&self) -> Option<String> {
        self.with(|t| t.id.clone())
    }
}

fn ser_duration_ms<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(d.as_secs_f64() * 1000.0)
}

fn ser_body<S: Serializer>(body: &Option<Bytes>, s: S) -> Result<S::Ok, S::Error> {
    match body {
        Some(b) => s.serialize_str(&String::from_utf8_lossy(b)),
        None => s.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_take_is_terminal() {
        let handle = TraceHandle::new(RequestTrace::new("abc", "GET", "/x"));
        assert_eq!(handle.id().as_deref(), Some("abc"));

        let trace = handle.take().expect("first take yields the trace");
        assert_eq!(trace.id, "abc");

        assert!(handle.take().is_none());
        assert!(handle.with(|t| t.id.clone()).is_none());
    }

    #[test]
    fn trace_serializes_durations_as_millis() {
        let mut trace = RequestTrace::new("abc", "GET", "/x");
        trace.latency = Duration::from_millis(250);
        let json = serde_json::to_value(&trace).unwrap();
        assert_eq!(json["latency_ms"], serde_json::json!(250.0));
    }
}
