//! Inline alert rules evaluated against every recorded trace.
//!
//! The engine is stateless: given a finalised trace and a snapshot of its
//! route aggregate it appends zero or more alerts to the trace and returns
//! them for the collector's log. Evaluating the same inputs twice yields the
//! same alerts (modulo the aggregate, which may have advanced).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::config::Config;
use crate::metrics::RouteMetrics;
use crate::trace::{Alert, RequestTrace, Severity};

pub struct AlertEngine {
    config: Arc<Config>,
}

impl AlertEngine {
    pub fn new(config: Arc<Config>) -> Self {
        Self { config }
    }

    /// Runs all six rules in order, appending every firing alert to
    /// `trace.alerts`. Returns the alerts emitted by this evaluation.
    pub fn evaluate(&self, trace: &mut RequestTrace, route: Option<&RouteMetrics>) -> Vec<Alert> {
        let mut emitted = Vec::new();
        self.check_n_plus_one(trace, &mut emitted);
        self.check_slow_queries(trace, &mut emitted);
        self.check_slow_route(trace, route, &mut emitted);
        self.check_high_error_rate(trace, route, &mut emitted);
        self.check_memory_spike(trace, &mut emitted);
        self.check_panic(trace, &mut emitted);
        trace.alerts.extend(emitted.iter().cloned());
        emitted
    }

    fn check_n_plus_one(&self, trace: &RequestTrace, out: &mut Vec<Alert>) {
        if trace.db_queries.is_empty() {
            return;
        }
        let mut patterns: HashMap<String, usize> = HashMap::new();
        for q in &trace.db_queries {
            *patterns.entry(query_pattern(&q.query)).or_insert(0) += 1;
        }
        for (pattern, count) in patterns {
            if count > self.config.n_plus_one_threshold {
                out.push(self.alert(
                    trace,
                    "n_plus_one",
                    Severity::Warning,
                    format!("N+1 query detected: pattern {pattern:?} executed {count} times"),
                    [
                        ("pattern".to_string(), json!(pattern)),
                        ("count".to_string(), json!(count)),
                    ],
                ));
            }
        }
    }

    fn check_slow_queries(&self, trace: &RequestTrace, out: &mut Vec<Alert>) {
        let threshold = self.config.slow_query_threshold();
        for q in &trace.db_queries {
            if q.duration > threshold {
                out.push(self.alert(
                    trace,
                    "slow_query",
                    Severity::Warning,
                    format!(
                        "Slow query: {} took {:?}",
                        truncate(&q.query, 100),
                        q.duration
                    ),
                    [
                        ("query".to_string(), json!(q.query)),
                        ("duration_ms".to_string(), json!(q.duration.as_millis() as u64)),
                    ],
                ));
            }
        }
    }

    fn check_slow_route(
        &self,
        trace: &RequestTrace,
        route: Option<&RouteMetrics>,
        out: &mut Vec<Alert>,
    ) {
        let Some(rm) = route else { return };
        if rm.total_requests < 10 {
            return;
        }
        let p95 = rm.p95();
        if p95 > self.config.slow_route_p95_threshold() {
            out.push(self.alert(
                trace,
                "slow_route",
                Severity::Warning,
                format!("Slow route: {} {} P95={:?}", trace.method, trace.route_pattern, p95),
                [("p95_ms".to_string(), json!(p95.as_millis() as u64))],
            ));
        }
    }

    fn check_high_error_rate(
        &self,
        trace: &RequestTrace,
        route: Option<&RouteMetrics>,
        out: &mut Vec<Alert>,
    ) {
        let Some(rm) = route else { return };
        if rm.total_requests < 10 {
            return;
        }
        let error_rate = rm.error_rate();
        if error_rate > self.config.high_error_rate_percent {
            out.push(self.alert(
                trace,
                "high_error_rate",
                Severity::Critical,
                format!(
                    "High error rate: {} {} at {error_rate:.1}%",
                    trace.method, trace.route_pattern
                ),
                [("error_rate".to_string(), json!(error_rate))],
            ));
        }
    }

    fn check_memory_spike(&self, trace: &RequestTrace, out: &mut Vec<Alert>) {
        if trace.mem_alloc_after > trace.mem_alloc_before {
            let delta = trace.mem_alloc_after - trace.mem_alloc_before;
            if delta > self.config.memory_spike_bytes {
                out.push(self.alert(
                    trace,
                    "memory_spike",
                    Severity::Warning,
                    format!(
                        "Memory spike: {} {} allocated {}",
                        trace.method,
                        trace.path,
                        format_bytes(delta)
                    ),
                    [("bytes_allocated".to_string(), json!(delta))],
                ));
            }
        }
    }

    fn check_panic(&self, trace: &RequestTrace, out: &mut Vec<Alert>) {
        if trace.panicked {
            let value = trace.panic_value.clone().unwrap_or_default();
            out.push(self.alert(
                trace,
                "panic",
                Severity::Critical,
                format!("Panic in {} {}: {value}", trace.method, trace.path),
                [("panic_value".to_string(), json!(value))],
            ));
        }
    }

    fn alert<const N: usize>(
        &self,
        trace: &RequestTrace,
        kind: &str,
        severity: Severity,
        message: String,
        details: [(String, serde_json::Value); N],
    ) -> Alert {
        Alert {
            id: uuid::Uuid::new_v4().simple().to_string(),
            kind: kind.to_string(),
            message,
            severity,
            route_pattern: trace.route_pattern.clone(),
            request_id: trace.id.clone(),
            timestamp: Utc::now(),
            details: details.into_iter().collect(),
        }
    }
}

/// Reduces a SQL text to an "OP TABLE" shape so repeats of one query with
/// different literals group together.
pub(crate) fn query_pattern(query: &str) -> String {
    let query = query.trim();
    let parts: Vec<&str> = query.split_whitespace().collect();
    if parts.len() < 2 {
        return query.to_string();
    }
    let op = parts[0].to_uppercase();
    let mut table = "";
    for (i, p) in parts.iter().enumerate() {
        let upper = p.to_uppercase();
        if matches!(upper.as_str(), "FROM" | "INTO" | "UPDATE" | "TABLE") {
            if let Some(next) = parts.get(i + 1) {
                table = next;
                break;
            }
        }
    }
    if table.is_empty() {
        table = parts[1];
    }
    format!("{op} {table}")
}

pub(crate) fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

pub(crate) fn format_bytes(b: u64) -> String {
    const UNIT: u64 = 1024;
    if b < UNIT {
        return format!("{b} B");
    }
    let mut div = UNIT;
    let mut exp = 0;
    let mut n = b / UNIT;
    while n >= UNIT {
        div *= UNIT;
        exp += 1;
        n /= UNIT;
    }
    format!("{:.1} {}B", b as f64 / div as f64, ["K", "M", "G", "T", "P", "E"][exp])
}
