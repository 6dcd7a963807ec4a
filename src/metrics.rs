//! Per-route running statistics.
//!
//! One [`RouteMetrics`] exists per `(method, route pattern)` pair, created
//! lazily on first record and never destroyed. Reads outside the collector
//! lock always go through [`RouteMetrics::snapshot`], which deep-copies the
//! mutable fields so rendering never contends with recording.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;

use crate::trace::RequestTrace;

/// Health classification for a route, derived from error rate and p95.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RouteStatus {
    Healthy,
    Warning,
    Critical,
}

impl RouteStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteStatus::Healthy => "healthy",
            RouteStatus::Warning => "warning",
            RouteStatus::Critical => "critical",
        }
    }
}

/// Running statistics for one `(method, route pattern)` pair.
#[derive(Debug, Clone, Serialize)]
pub struct RouteMetrics {
    pub pattern: String,
    pub method: String,
    pub total_requests: u64,
    /// Responses with status >= 500.
    pub error_count: u64,
    #[serde(skip)]
    pub total_latency: Duration,
    /// Latency sample reservoir for percentile computation.
    #[serde(skip)]
    pub latencies: Vec<Duration>,

    pub status_codes: HashMap<u16, u64>,
    pub avg_db_queries: f64,
    total_db_queries: u64,

    #[serde(skip)]
    pub min_latency: Duration,
    #[serde(skip)]
    pub max_latency: Duration,

    pub last_request_at: Option<DateTime<Utc>>,
    latency_cap: usize,
}

impl RouteMetrics {
    pub fn new(pattern: impl Into<String>, method: impl Into<String>, latency_cap: usize) -> Self {
        let latency_cap = if latency_cap == 0 { 10_000 } else { latency_cap };
        Self {
            pattern: pattern.into(),
            method: method.into(),
            total_requests: 0,
            error_count: 0,
            total_latency: Duration::ZERO,
            latencies: Vec::new(),
            status_codes: HashMap::new(),
            avg_db_queries: 0.0,
            total_db_queries: 0,
            min_latency: Duration::MAX,
            max_latency: Duration::ZERO,
            last_request_at: None,
            latency_cap,
        }
    }

    /// Fold one completed trace into the aggregate.
    pub fn record(&mut self, trace: &RequestTrace) {
        self.total_requests += 1;
        self.total_latency += trace.latency;
        self.last_request_at = Some(trace.started_at);

        if trace.latency < self.min_latency {
            self.min_latency = trace.latency;
        }
        if trace.latency > self.max_latency {
            self.max_latency = trace.latency;
        }

        if trace.response_status >= 500 {
            self.error_count += 1;
        }
        *self.status_codes.entry(trace.response_status).or_insert(0) += 1;

        self.total_db_queries += trace.db_queries.len() as u64;
        self.avg_db_queries = self.total_db_queries as f64 / self.total_requests as f64;

        self.observe_latency(trace.latency);
    }

    /// Reservoir sampling, algorithm R: the first `latency_cap` samples are
    /// kept verbatim; afterwards sample n replaces a uniformly random slot
    /// with probability cap/n.
    fn observe_latency(&mut self, latency: Duration) {
        if self.latencies.len() < self.latency_cap {
            self.latencies.push(latency);
            return;
        }
        let seen = self.total_requests as usize;
        let slot = rand::thread_rng().gen_range(0..seen);
        if slot < self.latency_cap {
            self.latencies[slot] = latency;
        }
    }

    pub fn avg_latency(&self) -> Duration {
        if self.total_requests == 0 {
            return Duration::ZERO;
        }
        self.total_latency / self.total_requests as u32
    }

    /// Error rate as a percentage of total requests.
    pub fn error_rate(&self) -> f64 {
        if self.total_requests == 0 {
            return 0.0;
        }
        self.error_count as f64 / self.total_requests as f64 * 100.0
    }

    /// Percentile over the sample reservoir; zero when empty.
    pub fn percentile(&self, p: f64) -> Duration {
        if self.latencies.is_empty() {
            return Duration::ZERO;
        }
        let mut sorted = self.latencies.clone();
        sorted.sort_unstable();
        let idx = ((sorted.len() - 1) as f64 * p / 100.0) as usize;
        sorted[idx]
    }

    pub fn p50(&self) -> Duration {
        self.percentile(50.0)
    }

    pub fn p95(&self) -> Duration {
        self.percentile(95.0)
    }

    pub fn p99(&self) -> Duration {
        self.percentile(99.0)
    }

    pub fn status(&self) -> RouteStatus {
        let err_rate = self.error_rate();
        let p95 = self.p95();
        if err_rate > 10.0 || p95 > Duration::from_secs(2) {
            return RouteStatus::Critical;
        }
        if err_rate > 5.0 || p95 > Duration::from_secs(1) {
            return RouteStatus::Warning;
        }
        RouteStatus::Healthy
    }

    /// Deep copy for use outside the collector lock.
    pub fn snapshot(&self) -> RouteMetrics {
        self.clone()
    }

    /// Min latency, or zero before the first record.
    pub fn min(&self) -> Duration {
        if self.total_requests == 0 {
            Duration::ZERO
        } else {
            self.min_latency
        }
    }

    pub fn max(&self) -> Duration {
        self.max_latency
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn trace_with(latency_ms: u64, status: u16) -> RequestTrace {
        let mut t = RequestTrace::new("id", "GET", "/test");
        t.route_pattern = "/test".to_string();
        t.latency = Duration::from_millis(latency_ms);
        t.response_status = status;
        t
    }

    #[test]
    fn aggregates_counts_and_bounds() {
        let mut rm = RouteMetrics::new("/api/users", "GET", 10_000);
        for i in 0..20 {
            let status = if i % 5 == 0 { 500 } else { 200 };
            rm.record(&trace_with(10 + i, status));
        }

        assert_eq!(rm.total_requests, 20);
        assert_eq!(rm.error_count, 4);
        assert!((rm.error_rate() - 20.0).abs() < f64::EPSILON);
        assert_eq!(rm.status_codes.values().sum::<u64>(), rm.total_requests);
        assert_eq!(rm.min(), Duration::from_millis(10));
        assert_eq!(rm.max(), Duration::from_millis(29));
        assert!(rm.min() <= rm.avg_latency() && rm.avg_latency() <= rm.max());
    }

    #[test]
    fn percentiles_over_uniform_latencies() {
        let mut rm = RouteMetrics::new("/test", "GET", 10_000);
        for i in 1..=100u64 {
            rm.record(&trace_with(i, 200));
        }

        let p50 = rm.p50();
        assert!(
            p50 >= Duration::from_millis(49) && p50 <= Duration::from_millis(51),
            "p50 = {p50:?}"
        );
        let p95 = rm.p95();
        assert!(
            p95 >= Duration::from_millis(94) && p95 <= Duration::from_millis(96),
            "p95 = {p95:?}"
        );
        let p99 = rm.p99();
        assert!(
            p99 >= Duration::from_millis(98) && p99 <= Duration::from_millis(100),
            "p99 = {p99:?}"
        );
    }

    #[test]
    fn empty_reservoir_yields_zero() {
        let rm = RouteMetrics::new("/test", "GET", 100);
        assert_eq!(rm.p95(), Duration::ZERO);
        assert_eq!(rm.avg_latency(), Duration::ZERO);
        assert_eq!(rm.error_rate(), 0.0);
    }

    #[test]
    fn reservoir_stays_at_capacity() {
        let mut rm = RouteMetrics::new("/test", "GET", 16);
        for i in 0..200u64 {
            rm.record(&trace_with(i, 200));
        }
        assert_eq!(rm.latencies.len(), 16);
        assert_eq!(rm.total_requests, 200);
    }

    #[test]
    fn status_thresholds() {
        let mut rm = RouteMetrics::new("/test", "GET", 1000);
        for _ in 0..100 {
            rm.record(&trace_with(5, 200));
        }
        assert_eq!(rm.status(), RouteStatus::Healthy);

        let mut slow = RouteMetrics::new("/slow", "GET", 1000);
        for _ in 0..100 {
            slow.record(&trace_with(1_500, 200));
        }
        assert_eq!(slow.status(), RouteStatus::Warning);

        let mut erroring = RouteMetrics::new("/errors", "GET", 1000);
        for i in 0..100 {
            let status = if i % 2 == 0 { 500 } else { 200 };
            erroring.record(&trace_with(5, status));
        }
        assert_eq!(erroring.status(), RouteStatus::Critical);
    }
}
