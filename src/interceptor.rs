//! Response observation: status, size, TTFB, and optional body capture.
//!
//! The middleware wraps the downstream response body in a
//! [`ResponseObserver`], which forwards frames verbatim while accumulating
//! the total size and, when capture is enabled, a copy of every byte. The
//! trace is finalised exactly once: at end-of-stream, on a body error, or
//! when the body is dropped mid-stream (client disconnect), so a truncated
//! response still records a trace.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};
use std::time::Instant;

use axum::body::Body;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use http_body::{Frame, SizeHint};
use pin_project_lite::pin_project;

use crate::collector::Collector;
use crate::runtime;
use crate::trace::TraceHandle;

/// Everything needed to finish and record a trace. Consumed exactly once;
/// the `TraceHandle` take() makes a second finalisation a no-op.
pub(crate) struct TraceFinalizer {
    pub(crate) handle: Arc<TraceHandle>,
    pub(crate) collector: Arc<Collector>,
    pub(crate) start: Instant,
}

impl TraceFinalizer {
    /// Sets the end-of-request fields and hands the trace to the collector.
    pub(crate) fn finalize(self, response_size: i64, captured_body: Option<Bytes>) {
        let Some(mut trace) = self.handle.take() else {
            return;
        };
        let after = runtime::sample();
        trace.ended_at = Utc::now();
        trace.latency = self.start.elapsed();
        trace.response_size = response_size;
        trace.response_body = captured_body;
        trace.tasks_after = after.tasks;
        trace.mem_alloc_after = after.allocated;
        self.collector.record(trace);
    }
}

pin_project! {
    /// Body wrapper that observes the response stream (§4.1 contract):
    /// frames pass through untouched, bytes are counted, and the trace is
    /// finalised on every exit path.
    pub struct ResponseObserver {
        #[pin]
        inner: Body,
        finalizer: Option<TraceFinalizer>,
        size: i64,
        captured: Option<BytesMut>,
    }

    impl PinnedDrop for ResponseObserver {
        fn drop(this: Pin<&mut Self>) {
            let this = this.project();
            finish(this.finalizer, *this.size, this.captured);
        }
    }
}

impl ResponseObserver {
    pub(crate) fn new(inner: Body, finalizer: TraceFinalizer, capture_body: bool) -> Self {
        Self {
            inner,
            finalizer: Some(finalizer),
            size: 0,
            captured: capture_body.then(BytesMut::new),
        }
    }
}

fn finish(finalizer: &mut Option<TraceFinalizer>, size: i64, captured: &mut Option<BytesMut>) {
    if let Some(finalizer) = finalizer.take() {
        let body = captured.take().map(BytesMut::freeze);
        finalizer.finalize(size, body);
    }
}

impl http_body::Body for ResponseObserver {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.project();
        match ready!(this.inner.poll_frame(cx)) {
            Some(Ok(frame)) => {
                if let Some(data) = frame.data_ref() {
                    *this.size += data.len() as i64;
                    if let Some(buf) = this.captured.as_mut() {
                        buf.extend_from_slice(data);
                    }
                }
                Poll::Ready(Some(Ok(frame)))
            }
            Some(Err(err)) => {
                finish(this.finalizer, *this.size, this.captured);
                Poll::Ready(Some(Err(err)))
            }
            None => {
                finish(this.finalizer, *this.size, this.captured);
                Poll::Ready(None)
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::trace::RequestTrace;
    use http_body_util::BodyExt;

    fn finalizer_for(collector: &Arc<Collector>, id: &str) -> (Arc<TraceHandle>, TraceFinalizer) {
        let mut trace = RequestTrace::new(id, "GET", "/test");
        trace.route_pattern = "/test".to_string();
        trace.response_status = 200;
        let handle = Arc::new(TraceHandle::new(trace));
        let finalizer = TraceFinalizer {
            handle: handle.clone(),
            collector: collector.clone(),
            start: Instant::now(),
        };
        (handle, finalizer)
    }

    #[tokio::test]
    async fn forwards_bytes_verbatim_and_records_on_eos() {
        let collector = Arc::new(Collector::new(Arc::new(Config::default())));
        let (_, finalizer) = finalizer_for(&collector, "obs-1");

        let observer = ResponseObserver::new(Body::from("hello world"), finalizer, true);
        let collected = observer.collect().await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"hello world");

        let recorded = collector.request_by_id("obs-1").expect("recorded trace");
        assert_eq!(recorded.response_size, 11);
        assert_eq!(recorded.response_body.as_deref(), Some(&b"hello world"[..]));
    }

    #[tokio::test]
    async fn records_truncated_trace_when_body_is_dropped() {
        let collector = Arc::new(Collector::new(Arc::new(Config::default())));
        let (_, finalizer) = finalizer_for(&collector, "obs-2");

        let observer = ResponseObserver::new(Body::from("partial"), finalizer, false);
        drop(observer);

        let recorded = collector.request_by_id("obs-2").expect("recorded trace");
        assert_eq!(recorded.response_size, 0);
        assert!(recorded.response_body.is_none());
    }

    #[tokio::test]
    async fn capture_disabled_counts_but_keeps_no_bytes() {
        let collector = Arc::new(Collector::new(Arc::new(Config::default())));
        let (_, finalizer) = finalizer_for(&collector, "obs-3");

        let observer = ResponseObserver::new(Body::from("abcdef"), finalizer, false);
        let _ = observer.collect().await.unwrap();

        let recorded = collector.request_by_id("obs-3").expect("recorded trace");
        assert_eq!(recorded.response_size, 6);
        assert!(recorded.response_body.is_none());
    }
}
