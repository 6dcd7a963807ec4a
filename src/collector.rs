//! In-memory trace store: ring buffer, per-route aggregates, alert log, and
//! live fan-out.
//!
//! One reader-writer lock protects the buffer, route map, and alert log; a
//! separate mutex protects the subscriber table. Lock order is always
//! collector first, subscribers second: fan-out never runs under the
//! collector lock, and nothing that holds the subscriber lock touches the
//! collector state.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use futures_util::Stream;
use tokio::sync::mpsc;

use crate::alerts::AlertEngine;
use crate::config::Config;
use crate::metrics::RouteMetrics;
use crate::trace::{Alert, RequestTrace};

/// Buffered events per live subscriber; a subscriber that falls further
/// behind loses events rather than stalling the recorder.
const LIVE_CHANNEL_CAPACITY: usize = 64;

struct State {
    buffer: Vec<Option<Arc<RequestTrace>>>,
    head: usize,
    count: usize,
    routes: HashMap<String, RouteMetrics>,
    alerts: VecDeque<Alert>,
}

struct SubscriberSlot {
    tx: mpsc::Sender<Arc<RequestTrace>>,
    dropped: u64,
}

/// Stores recent traces, maintains per-route aggregates, and fans completed
/// traces out to live subscribers.
pub struct Collector {
    state: RwLock<State>,
    subscribers: Mutex<HashMap<u64, SubscriberSlot>>,
    next_subscriber_id: AtomicU64,
    engine: AlertEngine,
    config: Arc<Config>,
    started_at: Instant,
}

impl Collector {
    pub fn new(config: Arc<Config>) -> Self {
        let buffer_size = config.buffer_size.max(1);
        Self {
            state: RwLock::new(State {
                buffer: vec![None; buffer_size],
                head: 0,
                count: 0,
                routes: HashMap::new(),
                alerts: VecDeque::new(),
            }),
            subscribers: Mutex::new(HashMap::new()),
            next_subscriber_id: AtomicU64::new(0),
            engine: AlertEngine::new(config.clone()),
            config,
            started_at: Instant::now(),
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Records a finalised trace: folds it into its route aggregate,
    /// evaluates alert rules against the updated aggregate, places the trace
    /// in the ring buffer, and notifies live subscribers.
    pub fn record(&self, mut trace: RequestTrace) -> Arc<RequestTrace> {
        let route_snapshot = {
            let mut state = self.state.write().expect("collector lock poisoned");
            let key = route_key(&trace.method, &trace.route_pattern);
            let cap = self.config.latency_cap;
            let rm = state.routes.entry(key).or_insert_with(|| {
                RouteMetrics::new(trace.route_pattern.clone(), trace.method.clone(), cap)
            });
            rm.record(&trace);
            rm.snapshot()
        };

        // Rule evaluation happens outside the lock; the engine is pure.
        let new_alerts = self.engine.evaluate(&mut trace, Some(&route_snapshot));

        let trace = Arc::new(trace);
        {
            let mut state = self.state.write().expect("collector lock poisoned");
            for alert in new_alerts {
                if state.alerts.len() >= self.config.alert_log_cap {
                    state.alerts.pop_front();
                }
                state.alerts.push_back(alert);
            }
            let head = state.head;
            let size = state.buffer.len();
            state.buffer[head] = Some(trace.clone());
            state.head = (head + 1) % size;
            if state.count < size {
                state.count += 1;
            }
        }

        self.notify_subscribers(&trace);
        trace
    }

    fn notify_subscribers(&self, trace: &Arc<RequestTrace>) {
        let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
        let mut closed = Vec::new();
        for (id, slot) in subscribers.iter_mut() {
            match slot.tx.try_send(trace.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => slot.dropped += 1,
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
            }
        }
        for id in closed {
            subscribers.remove(&id);
        }
    }

    /// Up to `limit` most recent traces, newest first.
    pub fn recent_requests(&self, limit: usize) -> Vec<Arc<RequestTrace>> {
        let state = self.state.read().expect("collector lock poisoned");
        let limit = if limit == 0 || limit > state.count {
            state.count
        } else {
            limit
        };
        let size = state.buffer.len();
        let mut result = Vec::with_capacity(limit);
        for i in 0..limit {
            let idx = (state.head + size - 1 - i) % size;
            if let Some(trace) = &state.buffer[idx] {
                result.push(trace.clone());
            }
        }
        result
    }

    /// Every trace currently in the ring buffer, newest first.
    pub fn all_requests(&self) -> Vec<Arc<RequestTrace>> {
        self.recent_requests(0)
    }

    /// Linear scan of the ring buffer for one trace id.
    pub fn request_by_id(&self, id: &str) -> Option<Arc<RequestTrace>> {
        let state = self.state.read().expect("collector lock poisoned");
        let size = state.buffer.len();
        for i in 0..state.count {
            let idx = (state.head + size - 1 - i) % size;
            if let Some(trace) = &state.buffer[idx] {
                if trace.id == id {
                    return Some(trace.clone());
                }
            }
        }
        None
    }

    /// Snapshots of every route aggregate, ordered by total requests
    /// descending.
    pub fn routes(&self) -> Vec<RouteMetrics> {
        let state = self.state.read().expect("collector lock poisoned");
        let mut result: Vec<RouteMetrics> = state.routes.values().map(|rm| rm.snapshot()).collect();
        result.sort_by(|a, b| b.total_requests.cmp(&a.total_requests));
        result
    }

    /// Snapshot of one route aggregate.
    pub fn route(&self, method: &str, pattern: &str) -> Option<RouteMetrics> {
        let state = self.state.read().expect("collector lock poisoned");
        state
            .routes
            .get(&route_key(method, pattern))
            .map(|rm| rm.snapshot())
    }

    /// Recent traces for one route, newest first, capped at `limit`.
    pub fn requests_for_route(
        &self,
        method: &str,
        pattern: &str,
        limit: usize,
    ) -> Vec<Arc<RequestTrace>> {
        let state = self.state.read().expect("collector lock poisoned");
        let size = state.buffer.len();
        let mut result = Vec::new();
        for i in 0..state.count {
            let idx = (state.head + size - 1 - i) % size;
            if let Some(trace) = &state.buffer[idx] {
                if trace.method == method && trace.route_pattern == pattern {
                    result.push(trace.clone());
                    if result.len() >= limit {
                        break;
                    }
                }
            }
        }
        result
    }

    /// The alert log, oldest first.
    pub fn alerts(&self) -> Vec<Alert> {
        let state = self.state.read().expect("collector lock poisoned");
        state.alerts.iter().cloned().collect()
    }

    /// Registers a live subscriber. Dropping the returned subscription
    /// withdraws it.
    pub fn subscribe_live(self: &Arc<Self>) -> LiveSubscription {
        let (tx, rx) = mpsc::channel(LIVE_CHANNEL_CAPACITY);
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .insert(id, SubscriberSlot { tx, dropped: 0 });
        LiveSubscription {
            id,
            rx,
            collector: self.clone(),
        }
    }

    fn unsubscribe(&self, id: u64) {
        let slot = {
            let mut subscribers = self.subscribers.lock().expect("subscriber lock poisoned");
            subscribers.remove(&id)
        };
        if let Some(slot) = slot {
            if slot.dropped > 0 {
                tracing::warn!(
                    subscriber_id = id,
                    dropped = slot.dropped,
                    "live subscriber lost events to back-pressure"
                );
            }
        }
    }

    /// Events dropped so far for one subscriber because its channel was full.
    pub fn dropped_events(&self, id: u64) -> u64 {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .get(&id)
            .map(|slot| slot.dropped)
            .unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .expect("subscriber lock poisoned")
            .len()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Traces currently held in the ring buffer.
    pub fn request_count(&self) -> usize {
        self.state.read().expect("collector lock poisoned").count
    }

    pub fn route_count(&self) -> usize {
        self.state.read().expect("collector lock poisoned").routes.len()
    }
}

fn route_key(method: &str, pattern: &str) -> String {
    format!("{method} {pattern}")
}

/// A registered live subscriber. Yields every recorded trace; lags drop
/// events rather than stalling the recorder. Unsubscribes on drop.
pub struct LiveSubscription {
    id: u64,
    rx: mpsc::Receiver<Arc<RequestTrace>>,
    collector: Arc<Collector>,
}

impl LiveSubscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Events lost so far because this subscriber fell behind.
    pub fn dropped(&self) -> u64 {
        self.collector.dropped_events(self.id)
    }
}

impl Stream for LiveSubscription {
    type Item = Arc<RequestTrace>;

    fn poll_next(mut self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for LiveSubscription {
    fn drop(&mut self) {
        self.collector.unsubscribe(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use futures_util::StreamExt;
    use std::time::Duration;

    fn test_trace(id: &str, pattern: &str, status: u16, latency_ms: u64) -> RequestTrace {
        let mut t = RequestTrace::new(id, "GET", pattern);
        t.route_pattern = pattern.to_string();
        t.response_status = status;
        t.latency = Duration::from_millis(latency_ms);
        t
    }

    fn collector_with(config: Config) -> Arc<Collector> {
        Arc::new(Collector::new(Arc::new(config)))
    }

    #[test]
    fn records_and_reads_back() {
        let c = collector_with(Config::default().with_buffer_size(5));
        for i in 0..3 {
            c.record(test_trace(&format!("t{i}"), "/test", 200, 10));
        }

        assert_eq!(c.request_count(), 3);
        let recent = c.recent_requests(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].id, "t2");
        assert_eq!(recent[2].id, "t0");
    }

    #[test]
    fn ring_buffer_overflow_keeps_newest() {
        let c = collector_with(Config::default().with_buffer_size(3));
        for i in 0..10 {
            c.record(test_trace(&format!("t{i}"), "/test", 200, 1));
        }

        assert_eq!(c.request_count(), 3);
        let ids: Vec<_> = c.recent_requests(10).iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, vec!["t9", "t8", "t7"]);
    }

    #[test]
    fn request_by_id_scans_buffer() {
        let c = collector_with(Config::default());
        c.record(test_trace("test-id-123", "/api/users", 201, 5));

        let found = c.request_by_id("test-id-123").expect("trace by id");
        assert_eq!(found.method, "GET");
        assert!(c.request_by_id("nonexistent").is_none());
    }

    #[test]
    fn route_aggregates_update_on_record() {
        let c = collector_with(Config::default());
        for i in 0..20 {
            let status = if i % 5 == 0 { 500 } else { 200 };
            c.record(test_trace(&format!("t{i}"), "/api/users", status, 10 + i));
        }

        let routes = c.routes();
        assert_eq!(routes.len(), 1);
        let rm = &routes[0];
        assert_eq!(rm.total_requests, 20);
        assert_eq!(rm.error_count, 4);
        assert!((rm.error_rate() - 20.0).abs() < f64::EPSILON);
        assert_eq!(rm.status_codes.values().sum::<u64>(), 20);
        assert_eq!(rm.latencies.len(), 20);
    }

    #[test]
    fn requests_for_route_filters() {
        let c = collector_with(Config::default());
        c.record(test_trace("a", "/one", 200, 1));
        c.record(test_trace("b", "/two", 200, 1));
        c.record(test_trace("c", "/one", 200, 1));

        let one = c.requests_for_route("GET", "/one", 10);
        assert_eq!(one.len(), 2);
        assert_eq!(one[0].id, "c");
        assert!(c.requests_for_route("POST", "/one", 10).is_empty());
    }

    #[test]
    fn concurrent_recording_is_lossless_up_to_capacity() {
        let c = collector_with(Config::default().with_buffer_size(100));
        let mut handles = Vec::new();
        for w in 0..50 {
            let c = c.clone();
            handles.push(std::thread::spawn(move || {
                for j in 0..20 {
                    c.record(test_trace(&format!("w{w}-{j}"), "/test", 200, 1));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(c.request_count(), 100);
        let total: u64 = c.routes().iter().map(|r| r.total_requests).sum();
        assert_eq!(total, 1000);
    }

    #[test]
    fn alert_log_is_capped() {
        let config = Config::default()
            .with_alert_log_cap(5)
            .with_n_plus_one_threshold(1);
        let c = collector_with(config);
        for i in 0..10 {
            let mut t = test_trace(&format!("t{i}"), "/db", 200, 1);
            for _ in 0..3 {
                t.db_queries.push(crate::trace::DbQuery::new(
                    "SELECT * FROM items WHERE id = 1",
                    Duration::from_millis(1),
                ));
            }
            c.record(t);
        }

        let alerts = c.alerts();
        assert_eq!(alerts.len(), 5);
        // Oldest entries were evicted: the survivors reference recent traces.
        assert_eq!(alerts.last().unwrap().request_id, "t9");
    }

    #[tokio::test]
    async fn live_subscribers_receive_recorded_traces() {
        let c = collector_with(Config::default());
        let mut sub = c.subscribe_live();
        assert_eq!(c.subscriber_count(), 1);

        c.record(test_trace("live-1", "/test", 200, 1));
        let received = sub.next().await.expect("live event");
        assert_eq!(received.id, "live-1");

        drop(sub);
        assert_eq!(c.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn slow_subscribers_lose_events_not_the_recorder() {
        let c = collector_with(Config::default().with_buffer_size(500));
        let sub = c.subscribe_live();

        // Overrun the channel without draining it.
        for i in 0..(LIVE_CHANNEL_CAPACITY + 40) {
            c.record(test_trace(&format!("t{i}"), "/test", 200, 1));
        }

        assert_eq!(sub.dropped(), 40);
        assert_eq!(c.request_count(), LIVE_CHANNEL_CAPACITY + 40);
    }
}
