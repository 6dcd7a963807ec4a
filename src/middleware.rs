//! The request interception pipeline.
//!
//! [`TraceLayer`] wraps a downstream service. Per request it samples,
//! snapshots process stats, captures request metadata (and optionally the
//! body), publishes the trace on the task-local context, runs the handler
//! under a panic guard, and arranges finalisation through the response
//! observer. The host never sees an error from the pipeline: every internal
//! failure degrades the one trace it belongs to and nothing else.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, MatchedPath};
use bytes::Bytes;
use chrono::Utc;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use http::header::{CONTENT_LENGTH, USER_AGENT};
use http::{HeaderMap, Request, Response, StatusCode};
use http_body_util::BodyExt;
use rand::Rng;
use tower::{Layer, Service};

use crate::collector::Collector;
use crate::config::Config;
use crate::context;
use crate::interceptor::{ResponseObserver, TraceFinalizer};
use crate::runtime;
use crate::trace::{RequestTrace, TraceHandle};

const PANIC_BODY: &str = "Internal Server Error";
const PANIC_STACK_LIMIT: usize = 4096;

/// Tower layer producing the tracing middleware.
#[derive(Clone)]
pub struct TraceLayer {
    collector: Arc<Collector>,
    config: Arc<Config>,
}

impl TraceLayer {
    /// Builds a layer recording into an explicit collector. This is the
    /// preferred constructor; the global facade in the crate root is a
    /// convenience over it.
    pub fn new(collector: Arc<Collector>, config: Arc<Config>) -> Self {
        Self { collector, config }
    }
}

impl<S> Layer<S> for TraceLayer {
    type Service = TraceService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        TraceService {
            inner,
            collector: self.collector.clone(),
            config: self.config.clone(),
        }
    }
}

/// The wrapped service. See the module docs for the per-request steps.
#[derive(Clone)]
pub struct TraceService<S> {
    inner: S,
    collector: Arc<Collector>,
    config: Arc<Config>,
}

impl<S> Service<Request<Body>> for TraceService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        // The service readiness belongs to the instance poll_ready was
        // called on; swap a clone in so the original keeps it.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let collector = self.collector.clone();
        let config = self.config.clone();

        Box::pin(async move {
            if !sampled(config.sampling_rate) {
                return inner.call(req).await;
            }

            let start = Instant::now();
            let before = runtime::sample();

            let mut trace = RequestTrace::new(
                uuid::Uuid::new_v4().simple().to_string(),
                req.method().as_str(),
                req.uri().path(),
            );
            trace.started_at = Utc::now();
            // When layered inside an axum router the matched pattern is
            // already on the request; other routers set it later through
            // `set_route_pattern`.
            if let Some(matched) = req.extensions().get::<MatchedPath>() {
                trace.route_pattern = matched.as_str().to_string();
            }
            trace.query_params = req.uri().query().unwrap_or("").to_string();
            trace.client_ip = client_ip(&req);
            trace.user_agent = req
                .headers()
                .get(USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("")
                .to_string();
            trace.request_size = req
                .headers()
                .get(CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(0);
            trace.tasks_before = before.tasks;
            trace.mem_alloc_before = before.allocated;
            if config.capture_headers {
                trace.request_headers = flatten_headers(req.headers());
            }

            let req = if config.capture_body {
                let (parts, body) = req.into_parts();
                match body.collect().await {
                    Ok(collected) => {
                        let bytes: Bytes = collected.to_bytes();
                        if trace.request_size == 0 {
                            trace.request_size = bytes.len() as i64;
                        }
                        trace.request_body = Some(bytes.clone());
                        Request::from_parts(parts, Body::from(bytes))
                    }
                    Err(err) => {
                        // Capture failure degrades the trace, never the
                        // request.
                        tracing::warn!(error = %err, "request body capture failed");
                        Request::from_parts(parts, Body::empty())
                    }
                }
            } else {
                req
            };

            let handle = Arc::new(TraceHandle::new(trace));
            let capture_body = config.capture_body;
            let capture_headers = config.capture_headers;
            let finalizer = TraceFinalizer {
                handle: handle.clone(),
                collector,
                start,
            };

            let outcome =
                AssertUnwindSafe(context::scope(handle.clone(), inner.call(req)))
                    .catch_unwind()
                    .await;

            match outcome {
                Ok(Ok(response)) => {
                    let ttfb = start.elapsed();
                    let status = response.status().as_u16();
                    let headers = capture_headers.then(|| flatten_headers(response.headers()));
                    handle.with(move |t| {
                        t.ttfb = ttfb;
                        t.handler_time = ttfb;
                        t.response_status = status;
                        if let Some(headers) = headers {
                            t.response_headers = headers;
                        }
                    });
                    let (parts, body) = response.into_parts();
                    let observed = ResponseObserver::new(body, finalizer, capture_body);
                    Ok(Response::from_parts(parts, Body::new(observed)))
                }
                Ok(Err(err)) => {
                    // Downstream service error: record what we have and let
                    // the error pass through untouched.
                    finalizer.finalize(0, None);
                    Err(err)
                }
                Err(payload) => {
                    let ttfb = start.elapsed();
                    let value = panic_message(payload.as_ref());
                    let mut stack = std::backtrace::Backtrace::force_capture().to_string();
                    truncate_in_place(&mut stack, PANIC_STACK_LIMIT);
                    tracing::error!(panic = %value, "handler panicked; responding 500");
                    handle.with(move |t| {
                        t.panicked = true;
                        t.panic_value = Some(value);
                        t.panic_stack = stack;
                        t.ttfb = ttfb;
                        t.handler_time = ttfb;
                        t.response_status = StatusCode::INTERNAL_SERVER_ERROR.as_u16();
                    });
                    let captured = capture_body.then(|| Bytes::from_static(PANIC_BODY.as_bytes()));
                    finalizer.finalize(PANIC_BODY.len() as i64, captured);

                    let response = Response::builder()
                        .status(StatusCode::INTERNAL_SERVER_ERROR)
                        .body(Body::from(PANIC_BODY))
                        .expect("static 500 response");
                    Ok(response)
                }
            }
        })
    }
}

/// Sampling decision; rates at or beyond the ends skip the RNG entirely.
fn sampled(rate: f64) -> bool {
    if rate >= 1.0 {
        return true;
    }
    if rate <= 0.0 {
        return false;
    }
    rand::thread_rng().gen::<f64>() < rate
}

/// `X-Forwarded-For` first hop, then `X-Real-IP`, then the socket peer.
fn client_ip(req: &Request<Body>) -> String {
    if let Some(xff) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return xff.split(',').next().unwrap_or(xff).trim().to_string();
    }
    if let Some(xri) = req
        .headers()
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
    {
        return xri.to_string();
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_default()
}

/// Collapses a header map to single string values, comma-joining repeats.
fn flatten_headers(headers: &HeaderMap) -> HashMap<String, String> {
    let mut map: HashMap<String, String> = HashMap::new();
    for (name, value) in headers {
        let value = String::from_utf8_lossy(value.as_bytes()).into_owned();
        map.entry(name.as_str().to_string())
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    map
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn truncate_in_place(s: &mut String, limit: usize) {
    if s.len() <= limit {
        return;
    }
    let mut end = limit;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    s.truncate(end);
}
